// Qbank aggregates CLI
// 子命令：
//   check    对比聚合索引与主表计数，输出偏差报告
//   rebuild  清空并从主表重建全部聚合索引
//   collect  从 stdin 读取 CollectRequest（JSON），输出组卷结果

use std::io::Read;
use std::sync::Arc;

use anyhow::{bail, Context};
use qbank_aggregates_lib::config::IndexBackend;
use qbank_aggregates_lib::database::PoolOptions;
use qbank_aggregates_lib::reconcile::AggregateReconciler;
use qbank_aggregates_lib::{AggregateSet, CollectRequest, QbankConfig, QbankDatabase, QuizQuestionCollector};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = QbankConfig::from_env_and_file()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_filter)),
        )
        .init();

    let command = std::env::args().nth(1).unwrap_or_else(|| "check".to_string());

    let db = Arc::new(
        QbankDatabase::with_options(&cfg.data_dir, PoolOptions::from(&cfg))
            .with_context(|| format!("failed to open database under {}", cfg.data_dir.display()))?,
    );
    let indexes = AggregateSet::for_backend(cfg.index_backend, Arc::clone(&db));
    let reconciler = AggregateReconciler::new(Arc::clone(&db), indexes.clone());

    // 进程内索引启动时为空
    if cfg.index_backend == IndexBackend::Memory && command != "rebuild" {
        info!("[Qbank::Cli] Memory backend selected, warming indexes from primary table");
        reconciler.rebuild().await?;
    }

    match command.as_str() {
        "check" => {
            let report = reconciler.check_drift().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_consistent() {
                std::process::exit(2);
            }
        }
        "rebuild" => {
            let report = reconciler.rebuild().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_clean() {
                std::process::exit(2);
            }
        }
        "collect" => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            let request: CollectRequest =
                serde_json::from_str(&buf).context("stdin is not a valid CollectRequest")?;
            let collector = QuizQuestionCollector::new(Arc::clone(&db), indexes);
            let questions = collector.collect(&request).await?;
            println!("{}", serde_json::to_string_pretty(&questions)?);
        }
        other => bail!("unknown command '{}', expected check | rebuild | collect", other),
    }
    Ok(())
}
