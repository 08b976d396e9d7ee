//! 组卷入口 `collect_questions`
//!
//! 模式 `all` 走聚合索引随机抽题，其余模式走用户候选池过滤；
//! 两条路径都在最后洗牌并截断到 `max_count`。

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::aggregates::AggregateSet;
use crate::database::QbankDatabase;
use crate::error::QbankResult;
use crate::mode_filter::{ModeFilteredPoolResolver, QuizMode};
use crate::models::{Question, ScopeSelection};
use crate::repos::QuestionRepo;
use crate::sampling::RandomSamplingAssembler;
use crate::scope_resolver::ScopeResolver;

/// 组卷请求
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectRequest {
    pub user_id: String,
    pub mode: String,
    #[serde(flatten)]
    pub selection: ScopeSelection,
    pub max_count: usize,
}

pub struct QuizQuestionCollector {
    db: Arc<QbankDatabase>,
    assembler: RandomSamplingAssembler,
}

impl QuizQuestionCollector {
    pub fn new(db: Arc<QbankDatabase>, indexes: AggregateSet) -> Self {
        let assembler = RandomSamplingAssembler::new(Arc::clone(&db), indexes);
        Self { db, assembler }
    }

    pub async fn collect(&self, request: &CollectRequest) -> QbankResult<Vec<Question>> {
        let mode: QuizMode = request.mode.parse()?;
        self.collect_with_mode(&request.user_id, mode, &request.selection, request.max_count)
            .await
    }

    /// 按模式与分类选择组卷，结果已洗牌且至多 `max_count` 道
    ///
    /// 未知模式返回 `QbankError::InvalidMode`。
    pub async fn collect_questions(
        &self,
        user_id: &str,
        mode: &str,
        themes: &[String],
        subthemes: &[String],
        groups: &[String],
        max_count: usize,
    ) -> QbankResult<Vec<Question>> {
        let mode: QuizMode = mode.parse()?;
        let selection = ScopeSelection::new(
            themes.iter().cloned(),
            subthemes.iter().cloned(),
            groups.iter().cloned(),
        );
        self.collect_with_mode(user_id, mode, &selection, max_count)
            .await
    }

    pub async fn collect_with_mode(
        &self,
        user_id: &str,
        mode: QuizMode,
        selection: &ScopeSelection,
        max_count: usize,
    ) -> QbankResult<Vec<Question>> {
        if max_count == 0 {
            return Ok(Vec::new());
        }

        let effective = ScopeResolver::resolve(&self.db, selection)?;

        let mut questions = if mode.is_user_filtered() {
            ModeFilteredPoolResolver::resolve(&self.db, user_id, mode, &effective)?
        } else {
            let ids = self.assembler.assemble(&effective, max_count).await;
            let questions = QuestionRepo::get_questions_by_ids(&self.db, &ids)?;
            if questions.len() < ids.len() {
                // 索引中残留已删除题目的条目，等待对账清理
                warn!(
                    "[Qbank::QuizBuilder] {} sampled id(s) have no primary row",
                    ids.len() - questions.len()
                );
            }
            questions
        };

        questions.shuffle(&mut rand::thread_rng());
        questions.truncate(max_count);

        info!(
            "[Qbank::QuizBuilder] user={} mode={} collected {} question(s) (max {})",
            user_id,
            mode,
            questions.len(),
            max_count
        );
        Ok(questions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate_sync::AggregateSyncService;
    use crate::error::QbankError;
    use crate::repos::UserRepo;
    use crate::test_utils::seed_fracture_bank;
    use assert_matches::assert_matches;
    use std::collections::HashSet;
    use tempfile::TempDir;

    async fn setup() -> (
        TempDir,
        Arc<QbankDatabase>,
        AggregateSyncService,
        QuizQuestionCollector,
    ) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db = Arc::new(QbankDatabase::new(temp_dir.path()).expect("Failed to create database"));
        let indexes = AggregateSet::sqlite(Arc::clone(&db));
        let sync = AggregateSyncService::new(Arc::clone(&db), indexes.clone());
        let collector = QuizQuestionCollector::new(Arc::clone(&db), indexes);
        (temp_dir, db, sync, collector)
    }

    #[tokio::test]
    async fn test_unknown_mode_is_rejected() {
        let (_temp_dir, _db, _sync, collector) = setup().await;
        let result = collector
            .collect_questions("u1", "favorites", &[], &[], &[], 10)
            .await;
        assert_matches!(result, Err(QbankError::InvalidMode(_)));
    }

    #[tokio::test]
    async fn test_all_mode_respects_max_count() {
        let (_temp_dir, _db, sync, collector) = setup().await;
        let bank = seed_fracture_bank(&sync).await.expect("seed");

        let result = collector
            .collect_questions("u1", "all", &[bank.trauma.id.clone()], &[], &[], 7)
            .await
            .expect("collect");
        assert_eq!(result.len(), 7);
        assert!(result.iter().all(|q| q.theme_id == bank.trauma.id));
        assert_eq!(result.iter().map(|q| &q.id).collect::<HashSet<_>>().len(), 7);
    }

    #[tokio::test]
    async fn test_bookmarked_mode_via_request() {
        let (_temp_dir, db, sync, collector) = setup().await;
        let bank = seed_fracture_bank(&sync).await.expect("seed");
        for q in bank.in_group(&bank.classificacao).take(3) {
            UserRepo::set_bookmark(&db, "u1", &q.id, true).expect("bookmark");
        }

        let request: CollectRequest = serde_json::from_value(serde_json::json!({
            "userId": "u1",
            "mode": "bookmarked",
            "subthemes": [bank.fraturas.id],
            "maxCount": 2
        }))
        .expect("request");
        let result = collector.collect(&request).await.expect("collect");
        assert_eq!(result.len(), 2);
        assert!(result
            .iter()
            .all(|q| q.group_id.as_deref() == Some(bank.classificacao.id.as_str())));
    }
}
