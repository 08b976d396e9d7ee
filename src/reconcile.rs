//! 聚合索引对账与重建
//!
//! 主题目表是唯一事实来源。同步扇出失败留下的缺失 / 孤儿条目在这里被发现和修复：
//! - `check_drift`：逐索引、逐命名空间比较索引计数与主表计数
//! - `rebuild`：清空每个索引并从主表重新派生全部条目

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::aggregates::{AggregateIndex, AggregateSet, Bounds, IndexId};
use crate::database::QbankDatabase;
use crate::error::QbankResult;
use crate::models::{Question, Scope};
use crate::repos::{QuestionRepo, TaxonomyRepo};

// ============================================================================
// 报告
// ============================================================================

/// 单个命名空间的计数偏差
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DriftEntry {
    pub index: IndexId,
    pub namespace: String,
    /// 主表计数
    pub expected: u64,
    /// 索引计数
    pub actual: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DriftReport {
    pub checked_namespaces: usize,
    pub drift: Vec<DriftEntry>,
    /// 无法读取的索引及错误信息
    pub unreadable: Vec<(IndexId, String)>,
}

impl DriftReport {
    pub fn is_consistent(&self) -> bool {
        self.drift.is_empty() && self.unreadable.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IndexRebuild {
    pub index: IndexId,
    pub cleared: u64,
    pub inserted: u64,
    pub failed: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RebuildReport {
    pub questions: usize,
    pub indexes: Vec<IndexRebuild>,
}

impl RebuildReport {
    pub fn is_clean(&self) -> bool {
        self.indexes
            .iter()
            .all(|index| index.failed == 0 && index.error.is_none())
    }
}

// ============================================================================
// 对账
// ============================================================================

pub struct AggregateReconciler {
    db: Arc<QbankDatabase>,
    indexes: AggregateSet,
}

impl AggregateReconciler {
    pub fn new(db: Arc<QbankDatabase>, indexes: AggregateSet) -> Self {
        Self { db, indexes }
    }

    /// 比较每个索引在每个命名空间的计数
    ///
    /// 检查的命名空间 = 主表中出现过的 ∪ 分类表中存在的节点 ∪ 索引自身持有的。
    pub async fn check_drift(&self) -> QbankResult<DriftReport> {
        let mut report = DriftReport::default();

        for id in IndexId::ALL {
            let index = self.indexes.get(id);
            let held = match index.namespaces().await {
                Ok(held) => held,
                Err(e) => {
                    error!(
                        index = %id,
                        error = %e,
                        "[Qbank::Reconcile] Failed to list aggregate namespaces"
                    );
                    report.unreadable.push((id, e.to_string()));
                    continue;
                }
            };

            let expected = QuestionRepo::count_grouped_by(&self.db, id.scope)?;
            let namespaces: BTreeSet<String> = expected
                .keys()
                .cloned()
                .chain(TaxonomyRepo::list_ids(&self.db, id.scope)?)
                .chain(held)
                .collect();

            let unbounded = Bounds::unbounded();
            let counts = join_all(
                namespaces
                    .iter()
                    .map(|namespace| index.count(namespace, &unbounded)),
            )
            .await;

            for (namespace, count) in namespaces.iter().zip(counts) {
                report.checked_namespaces += 1;
                let want = expected.get(namespace).copied().unwrap_or(0);
                match count {
                    Ok(actual) if actual == want => {}
                    Ok(actual) => {
                        warn!(
                            index = %id,
                            namespace = %namespace,
                            expected = want,
                            actual,
                            "[Qbank::Reconcile] Aggregate drift detected"
                        );
                        report.drift.push(DriftEntry {
                            index: id,
                            namespace: namespace.clone(),
                            expected: want,
                            actual,
                        });
                    }
                    Err(e) => {
                        error!(
                            index = %id,
                            error = %e,
                            "[Qbank::Reconcile] Failed to read aggregate index"
                        );
                        report.unreadable.push((id, e.to_string()));
                        break;
                    }
                }
            }
        }

        info!(
            "[Qbank::Reconcile] Checked {} namespace(s): {} drifted, {} unreadable index(es)",
            report.checked_namespaces,
            report.drift.len(),
            report.unreadable.len()
        );
        Ok(report)
    }

    /// 清空并从主表重建全部 8 个索引
    ///
    /// 索引之间并发重建；单个索引失败不影响其他索引。
    pub async fn rebuild(&self) -> QbankResult<RebuildReport> {
        let questions = Arc::new(QuestionRepo::list_by_scope(&self.db, &Scope::Global)?);
        info!(
            "[Qbank::Reconcile] Rebuilding aggregates from {} question(s)",
            questions.len()
        );

        let tasks = IndexId::ALL.iter().map(|id| {
            let index = Arc::clone(self.indexes.get(*id));
            let questions = Arc::clone(&questions);
            async move { rebuild_index(index.as_ref(), &questions).await }
        });
        let indexes = join_all(tasks).await;

        let report = RebuildReport {
            questions: questions.len(),
            indexes,
        };
        if report.is_clean() {
            info!("[Qbank::Reconcile] Rebuild finished cleanly");
        } else {
            warn!("[Qbank::Reconcile] Rebuild finished with failures, rerun to retry");
        }
        Ok(report)
    }
}

async fn rebuild_index(index: &dyn AggregateIndex, questions: &[Question]) -> IndexRebuild {
    let id = index.id();
    let mut result = IndexRebuild {
        index: id,
        cleared: 0,
        inserted: 0,
        failed: 0,
        error: None,
    };

    match index.clear(None).await {
        Ok(cleared) => result.cleared = cleared,
        Err(e) => {
            error!(index = %id, error = %e, "[Qbank::Reconcile] Failed to clear index");
            result.error = Some(e.to_string());
            return result;
        }
    }

    for entry in questions.iter().filter_map(|q| id.summary_for(q)) {
        match index.insert(&entry).await {
            Ok(()) => result.inserted += 1,
            Err(e) if e.is_entry_exists() => {}
            Err(e) => {
                result.failed += 1;
                result.error.get_or_insert_with(|| e.to_string());
            }
        }
    }

    if let Some(message) = &result.error {
        warn!(
            index = %id,
            failed = result.failed,
            error = %message,
            "[Qbank::Reconcile] Some entries could not be re-inserted"
        );
    }
    result
}
