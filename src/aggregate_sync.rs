//! 聚合索引同步编排
//!
//! 将题目的创建 / 更新 / 删除事件扇出到 8 个聚合索引。
//!
//! ## 原则
//! - 主题目表是唯一事实来源，主表写入失败才是致命错误
//! - 每个索引操作在独立的失败边界内执行，单个索引失败只记录日志，不影响其余索引，
//!   也不回滚主表
//! - 条目缺失（EntryMissing）是预期情况：删除视为成功，替换退化为插入（自愈）
//! - 残留的不一致由对账任务（`reconcile`）修复

use futures::future::{join_all, BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::aggregates::{AggregateIndex, AggregateSet, IndexId, SummaryEntry};
use crate::database::QbankDatabase;
use crate::error::{IndexError, QbankResult};
use crate::models::{CreateQuestionParams, Question, QuestionPatch, ScopeKind};
use crate::repos::QuestionRepo;

// ============================================================================
// 结果汇总
// ============================================================================

/// 触发同步的事件
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncOperation {
    Create,
    Update,
    Delete,
}

/// 单个索引的处理结果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "status", content = "detail")]
pub enum IndexOutcome {
    /// 已写入
    Applied,
    /// 题目没有该索引所需的作用域字段
    Skipped,
    /// 旧条目缺失，已直接写入新条目（替换或迁移时的自愈）
    Healed,
    /// 删除时条目本就不存在
    AlreadyAbsent,
    /// 插入时条目已存在
    AlreadyPresent,
    /// 其他错误（已记录日志，未向调用方传播）
    Failed(String),
}

impl IndexOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, IndexOutcome::Failed(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IndexReport {
    pub index: IndexId,
    pub outcome: IndexOutcome,
}

/// 一次扇出的逐索引结果（用于观测）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub question_id: String,
    pub operation: SyncOperation,
    pub outcomes: Vec<IndexReport>,
}

impl SyncReport {
    fn new(question_id: &str, operation: SyncOperation, outcomes: Vec<IndexReport>) -> Self {
        Self {
            question_id: question_id.to_string(),
            operation,
            outcomes,
        }
    }

    pub fn outcome(&self, index: IndexId) -> Option<&IndexOutcome> {
        self.outcomes
            .iter()
            .find(|report| report.index == index)
            .map(|report| &report.outcome)
    }

    pub fn failures(&self) -> impl Iterator<Item = &IndexReport> {
        self.outcomes.iter().filter(|report| report.outcome.is_failure())
    }

    pub fn failed_count(&self) -> usize {
        self.failures().count()
    }

    pub fn is_clean(&self) -> bool {
        self.failed_count() == 0
    }

    /// 没有触及任何索引（例如只修改了题干）
    pub fn is_noop(&self) -> bool {
        self.outcomes.is_empty()
    }
}

// ============================================================================
// 编排服务
// ============================================================================

pub struct AggregateSyncService {
    db: Arc<QbankDatabase>,
    indexes: AggregateSet,
}

impl AggregateSyncService {
    pub fn new(db: Arc<QbankDatabase>, indexes: AggregateSet) -> Self {
        Self { db, indexes }
    }

    pub fn database(&self) -> &Arc<QbankDatabase> {
        &self.db
    }

    pub fn indexes(&self) -> &AggregateSet {
        &self.indexes
    }

    /// 写入主表后同步聚合索引
    ///
    /// 主表写入失败直接返回错误；聚合索引失败体现在 `SyncReport` 中。
    pub async fn create_question(
        &self,
        params: &CreateQuestionParams,
    ) -> QbankResult<(Question, SyncReport)> {
        let question = QuestionRepo::create_question(&self.db, params)?;
        let report = self.on_create(&question).await;
        Ok((question, report))
    }

    /// 题目创建：向题目具备作用域字段的每个索引插入摘要条目
    pub async fn on_create(&self, question: &Question) -> SyncReport {
        let tasks = IndexId::ALL.iter().map(|id| {
            let index = Arc::clone(self.indexes.get(*id));
            let entry = id.summary_for(question);
            let question_id = question.id.clone();
            async move {
                let outcome = match entry {
                    None => IndexOutcome::Skipped,
                    Some(entry) => insert_entry(index.as_ref(), &entry, &question_id).await,
                };
                IndexReport {
                    index: index.id(),
                    outcome,
                }
            }
        });

        let report = SyncReport::new(&question.id, SyncOperation::Create, join_all(tasks).await);
        log_report(&report);
        report
    }

    /// 题目更新：先把补丁写入主表，再按实际变化的分类字段迁移条目
    ///
    /// - theme 变化：by-theme 两个索引 `replace`，旧条目缺失时退化为 `insert`
    /// - subtheme / group 变化：先删旧条目（若有），再插新条目（若有）
    /// - 全局索引永远不动：题目在整个题库中的成员关系没有变化
    pub async fn on_update(
        &self,
        old: &Question,
        patch: &QuestionPatch,
    ) -> QbankResult<SyncReport> {
        let updated = QuestionRepo::update_question(&self.db, &old.id, patch)?;

        let theme_changed = old.theme_id != updated.theme_id;
        let subtheme_changed = old.subtheme_id != updated.subtheme_id;
        let group_changed = old.group_id != updated.group_id;

        if !(theme_changed || subtheme_changed || group_changed) {
            debug!(
                "[Qbank::AggregateSync] Question {} updated without taxonomy change, aggregates untouched",
                old.id
            );
            return Ok(SyncReport::new(&old.id, SyncOperation::Update, Vec::new()));
        }

        let mut tasks: Vec<BoxFuture<'static, IndexReport>> = Vec::new();

        if theme_changed {
            for id in IndexId::pair_for(ScopeKind::Theme) {
                tasks.push(self.replace_task(id, old, &updated));
            }
        }
        if subtheme_changed {
            for id in IndexId::pair_for(ScopeKind::Subtheme) {
                tasks.push(self.move_task(id, old, &updated));
            }
        }
        if group_changed {
            for id in IndexId::pair_for(ScopeKind::Group) {
                tasks.push(self.move_task(id, old, &updated));
            }
        }

        let report = SyncReport::new(&old.id, SyncOperation::Update, join_all(tasks).await);
        log_report(&report);
        Ok(report)
    }

    /// 题目删除：删除主表行，然后从每个索引删除摘要条目
    ///
    /// 返回主表行是否被删除；重复删除不会报错（条目缺失视为成功）。
    pub async fn on_delete(&self, question: &Question) -> QbankResult<bool> {
        let removed = QuestionRepo::delete_question(&self.db, &question.id)?;
        if !removed {
            info!(
                "[Qbank::AggregateSync] Question {} already absent from primary table, cleaning aggregates only",
                question.id
            );
        }
        self.remove_from_indexes(question).await;
        Ok(removed)
    }

    /// 从全部 8 个索引删除题目的摘要条目（不触碰主表）
    pub async fn remove_from_indexes(&self, question: &Question) -> SyncReport {
        let tasks = IndexId::ALL.iter().map(|id| {
            let index = Arc::clone(self.indexes.get(*id));
            let entry = id.summary_for(question);
            let question_id = question.id.clone();
            async move {
                let outcome = match entry {
                    None => IndexOutcome::Skipped,
                    Some(entry) => delete_entry(index.as_ref(), &entry, &question_id).await,
                };
                IndexReport {
                    index: index.id(),
                    outcome,
                }
            }
        });

        let report = SyncReport::new(&question.id, SyncOperation::Delete, join_all(tasks).await);
        log_report(&report);
        report
    }

    fn replace_task(
        &self,
        id: IndexId,
        old: &Question,
        updated: &Question,
    ) -> BoxFuture<'static, IndexReport> {
        let index = Arc::clone(self.indexes.get(id));
        let old_entry = id.summary_for(old);
        let new_entry = id.summary_for(updated);
        let question_id = old.id.clone();

        async move {
            let outcome = match (old_entry, new_entry) {
                (Some(old_entry), Some(new_entry)) => {
                    match index.replace(&old_entry, &new_entry).await {
                        Ok(()) => IndexOutcome::Applied,
                        Err(e) if e.is_entry_missing() => {
                            warn!(
                                index = %id,
                                question_id = %question_id,
                                "[Qbank::AggregateSync] Replace found no prior entry, falling back to insert"
                            );
                            match insert_entry(index.as_ref(), &new_entry, &question_id).await {
                                IndexOutcome::Applied | IndexOutcome::AlreadyPresent => {
                                    IndexOutcome::Healed
                                }
                                other => other,
                            }
                        }
                        Err(e) => failed(id, &question_id, "replace", &e),
                    }
                }
                // theme 是必填字段，两侧都应存在
                _ => IndexOutcome::Skipped,
            };
            IndexReport { index: id, outcome }
        }
        .boxed()
    }

    fn move_task(
        &self,
        id: IndexId,
        old: &Question,
        updated: &Question,
    ) -> BoxFuture<'static, IndexReport> {
        let index = Arc::clone(self.indexes.get(id));
        let old_entry = id.summary_for(old);
        let new_entry = id.summary_for(updated);
        let question_id = old.id.clone();

        async move {
            let removal = match &old_entry {
                Some(entry) => Some(delete_entry(index.as_ref(), entry, &question_id).await),
                None => None,
            };
            let insertion = match &new_entry {
                Some(entry) => Some(insert_entry(index.as_ref(), entry, &question_id).await),
                None => None,
            };

            let outcome = match (removal, insertion) {
                (Some(failure @ IndexOutcome::Failed(_)), _)
                | (_, Some(failure @ IndexOutcome::Failed(_))) => failure,
                (None, None) => IndexOutcome::Skipped,
                (Some(IndexOutcome::AlreadyAbsent), Some(_)) => {
                    warn!(
                        index = %id,
                        question_id = %question_id,
                        "[Qbank::AggregateSync] Move found no prior entry, new entry written"
                    );
                    IndexOutcome::Healed
                }
                _ => IndexOutcome::Applied,
            };
            IndexReport { index: id, outcome }
        }
        .boxed()
    }
}

// ============================================================================
// 单索引操作（各自独立的失败边界）
// ============================================================================

async fn insert_entry(
    index: &dyn AggregateIndex,
    entry: &SummaryEntry,
    question_id: &str,
) -> IndexOutcome {
    match index.insert(entry).await {
        Ok(()) => IndexOutcome::Applied,
        Err(e) if e.is_entry_exists() => {
            debug!(
                "[Qbank::AggregateSync] {} already holds {}, treating insert as done",
                index.id(),
                entry.key()
            );
            IndexOutcome::AlreadyPresent
        }
        Err(e) => failed(index.id(), question_id, "insert", &e),
    }
}

async fn delete_entry(
    index: &dyn AggregateIndex,
    entry: &SummaryEntry,
    question_id: &str,
) -> IndexOutcome {
    match index.delete(entry).await {
        Ok(()) => IndexOutcome::Applied,
        Err(e) if e.is_entry_missing() => IndexOutcome::AlreadyAbsent,
        Err(e) => failed(index.id(), question_id, "delete", &e),
    }
}

fn failed(index: IndexId, question_id: &str, op: &str, err: &IndexError) -> IndexOutcome {
    error!(
        index = %index,
        question_id = %question_id,
        op = op,
        error = %err,
        "[Qbank::AggregateSync] Aggregate index operation failed (primary write kept)"
    );
    IndexOutcome::Failed(err.to_string())
}

fn log_report(report: &SyncReport) {
    let failed = report.failed_count();
    if failed > 0 {
        warn!(
            question_id = %report.question_id,
            operation = ?report.operation,
            failed,
            total = report.outcomes.len(),
            "[Qbank::AggregateSync] Aggregates partially synced, reconciliation will repair"
        );
    } else {
        debug!(
            "[Qbank::AggregateSync] {:?} {} synced across {} index(es)",
            report.operation,
            report.question_id,
            report.outcomes.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregates::Bounds;
    use crate::models::{Group, Subtheme, Theme};
    use crate::repos::TaxonomyRepo;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    struct Fixture {
        _temp_dir: TempDir,
        service: AggregateSyncService,
        db: Arc<QbankDatabase>,
        trauma: Theme,
        cardio: Theme,
        fraturas: Subtheme,
        classificacao: Group,
        tratamento: Group,
    }

    fn setup() -> Fixture {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db = Arc::new(QbankDatabase::new(temp_dir.path()).expect("Failed to create database"));
        let trauma = Theme::new("Trauma");
        let cardio = Theme::new("Cardiologia");
        let fraturas = Subtheme::new(&trauma.id, "Fraturas");
        let classificacao = Group::new(&fraturas.id, "Classificação");
        let tratamento = Group::new(&fraturas.id, "Tratamento");
        TaxonomyRepo::create_theme(&db, &trauma).expect("theme");
        TaxonomyRepo::create_theme(&db, &cardio).expect("theme");
        TaxonomyRepo::create_subtheme(&db, &fraturas).expect("subtheme");
        TaxonomyRepo::create_group(&db, &classificacao).expect("group");
        TaxonomyRepo::create_group(&db, &tratamento).expect("group");

        let service = AggregateSyncService::new(Arc::clone(&db), AggregateSet::sqlite(Arc::clone(&db)));
        Fixture {
            _temp_dir: temp_dir,
            service,
            db,
            trauma,
            cardio,
            fraturas,
            classificacao,
            tratamento,
        }
    }

    fn grouped(fx: &Fixture) -> CreateQuestionParams {
        CreateQuestionParams {
            title: "Classificação de Gustilo".to_string(),
            question_text: "Qual o tipo?".to_string(),
            explanation: None,
            theme_id: fx.trauma.id.clone(),
            subtheme_id: Some(fx.fraturas.id.clone()),
            group_id: Some(fx.classificacao.id.clone()),
        }
    }

    async fn count(fx: &Fixture, id: IndexId, namespace: &str) -> u64 {
        fx.service
            .indexes()
            .get(id)
            .count(namespace, &Bounds::unbounded())
            .await
            .expect("count")
    }

    #[tokio::test]
    async fn test_create_populates_all_applicable_indexes() {
        let fx = setup();
        let before = count(&fx, IndexId::COUNT_BY_GROUP, &fx.classificacao.id).await;
        let (_question, report) = fx.service.create_question(&grouped(&fx)).await.expect("create");

        assert!(report.is_clean());
        assert_eq!(report.outcomes.len(), 8);
        assert!(report
            .outcomes
            .iter()
            .all(|r| r.outcome == IndexOutcome::Applied));
        assert_eq!(
            count(&fx, IndexId::COUNT_BY_GROUP, &fx.classificacao.id).await,
            before + 1
        );
        assert_eq!(count(&fx, IndexId::TOTAL_COUNT, "").await, 1);
        assert_eq!(count(&fx, IndexId::RANDOM_BY_SUBTHEME, &fx.fraturas.id).await, 1);
    }

    #[tokio::test]
    async fn test_create_skips_missing_scope_fields() {
        let fx = setup();
        let params = CreateQuestionParams {
            subtheme_id: None,
            group_id: None,
            ..grouped(&fx)
        };
        let (_question, report) = fx.service.create_question(&params).await.expect("create");
        assert_eq!(
            report.outcome(IndexId::COUNT_BY_SUBTHEME),
            Some(&IndexOutcome::Skipped)
        );
        assert_eq!(
            report.outcome(IndexId::RANDOM_BY_GROUP),
            Some(&IndexOutcome::Skipped)
        );
        assert_eq!(
            report.outcome(IndexId::RANDOM_BY_THEME),
            Some(&IndexOutcome::Applied)
        );
    }

    #[tokio::test]
    async fn test_theme_move_keeps_total() {
        let fx = setup();
        let params = CreateQuestionParams {
            subtheme_id: None,
            group_id: None,
            ..grouped(&fx)
        };
        let (question, _) = fx.service.create_question(&params).await.expect("create");

        let patch = QuestionPatch {
            theme_id: Some(fx.cardio.id.clone()),
            ..Default::default()
        };
        let report = fx.service.on_update(&question, &patch).await.expect("update");
        assert!(report.is_clean());
        assert_eq!(report.outcomes.len(), 2);

        assert_eq!(count(&fx, IndexId::COUNT_BY_THEME, &fx.trauma.id).await, 0);
        assert_eq!(count(&fx, IndexId::COUNT_BY_THEME, &fx.cardio.id).await, 1);
        assert_eq!(count(&fx, IndexId::RANDOM_BY_THEME, &fx.cardio.id).await, 1);
        assert_eq!(count(&fx, IndexId::TOTAL_COUNT, "").await, 1);
    }

    #[tokio::test]
    async fn test_theme_replace_self_heals_missing_entry() {
        let fx = setup();
        let params = CreateQuestionParams {
            subtheme_id: None,
            group_id: None,
            ..grouped(&fx)
        };
        let (question, _) = fx.service.create_question(&params).await.expect("create");

        // 模拟之前的插入失败
        let stale = IndexId::COUNT_BY_THEME.summary_for(&question).expect("entry");
        fx.service
            .indexes()
            .get(IndexId::COUNT_BY_THEME)
            .delete(&stale)
            .await
            .expect("delete");

        let patch = QuestionPatch {
            theme_id: Some(fx.cardio.id.clone()),
            ..Default::default()
        };
        let report = fx.service.on_update(&question, &patch).await.expect("update");
        assert_eq!(
            report.outcome(IndexId::COUNT_BY_THEME),
            Some(&IndexOutcome::Healed)
        );
        assert_eq!(
            report.outcome(IndexId::RANDOM_BY_THEME),
            Some(&IndexOutcome::Applied)
        );
        assert_eq!(count(&fx, IndexId::COUNT_BY_THEME, &fx.cardio.id).await, 1);
    }

    #[tokio::test]
    async fn test_subtheme_move_self_heals_missing_entry() {
        let fx = setup();
        let luxacoes = Subtheme::new(&fx.trauma.id, "Luxações");
        TaxonomyRepo::create_subtheme(&fx.db, &luxacoes).expect("subtheme");
        let params = CreateQuestionParams {
            group_id: None,
            ..grouped(&fx)
        };
        let (question, _) = fx.service.create_question(&params).await.expect("create");

        // 模拟之前的插入失败
        let stale = IndexId::COUNT_BY_SUBTHEME.summary_for(&question).expect("entry");
        fx.service
            .indexes()
            .get(IndexId::COUNT_BY_SUBTHEME)
            .delete(&stale)
            .await
            .expect("delete");

        let patch = QuestionPatch {
            subtheme_id: Some(Some(luxacoes.id.clone())),
            ..Default::default()
        };
        let report = fx.service.on_update(&question, &patch).await.expect("update");
        assert!(report.is_clean());
        assert_eq!(
            report.outcome(IndexId::COUNT_BY_SUBTHEME),
            Some(&IndexOutcome::Healed)
        );
        assert_eq!(
            report.outcome(IndexId::RANDOM_BY_SUBTHEME),
            Some(&IndexOutcome::Applied)
        );
        assert_eq!(count(&fx, IndexId::COUNT_BY_SUBTHEME, &luxacoes.id).await, 1);
        assert_eq!(count(&fx, IndexId::COUNT_BY_SUBTHEME, &fx.fraturas.id).await, 0);
        assert_eq!(count(&fx, IndexId::RANDOM_BY_SUBTHEME, &fx.fraturas.id).await, 0);
    }

    #[tokio::test]
    async fn test_group_move_and_clear() {
        let fx = setup();
        let (question, _) = fx.service.create_question(&grouped(&fx)).await.expect("create");

        let to_tratamento = QuestionPatch {
            group_id: Some(Some(fx.tratamento.id.clone())),
            ..Default::default()
        };
        let report = fx
            .service
            .on_update(&question, &to_tratamento)
            .await
            .expect("update");
        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(count(&fx, IndexId::COUNT_BY_GROUP, &fx.classificacao.id).await, 0);
        assert_eq!(count(&fx, IndexId::COUNT_BY_GROUP, &fx.tratamento.id).await, 1);
        // subtheme 未变化
        assert_eq!(count(&fx, IndexId::COUNT_BY_SUBTHEME, &fx.fraturas.id).await, 1);

        let moved = QuestionRepo::get_question(&fx.db, &question.id)
            .expect("get")
            .expect("exists");
        let clear_group = QuestionPatch {
            group_id: Some(None),
            ..Default::default()
        };
        fx.service
            .on_update(&moved, &clear_group)
            .await
            .expect("update");
        assert_eq!(count(&fx, IndexId::RANDOM_BY_GROUP, &fx.tratamento.id).await, 0);
        assert_eq!(count(&fx, IndexId::RANDOM_BY_SUBTHEME, &fx.fraturas.id).await, 1);
    }

    #[tokio::test]
    async fn test_content_only_update_touches_nothing() {
        let fx = setup();
        let (question, _) = fx.service.create_question(&grouped(&fx)).await.expect("create");
        let patch = QuestionPatch {
            question_text: Some("Novo enunciado".to_string()),
            ..Default::default()
        };
        let report = fx.service.on_update(&question, &patch).await.expect("update");
        assert!(report.is_noop());

        let stored = QuestionRepo::get_question(&fx.db, &question.id)
            .expect("get")
            .expect("exists");
        assert_eq!(stored.question_text, "Novo enunciado");
    }

    #[tokio::test]
    async fn test_update_unknown_question_is_fatal() {
        let fx = setup();
        let (mut question, _) = fx.service.create_question(&grouped(&fx)).await.expect("create");
        question.id = "q_missing".to_string();
        let patch = QuestionPatch {
            title: Some("x".to_string()),
            ..Default::default()
        };
        let result = fx.service.on_update(&question, &patch).await;
        assert_matches!(result, Err(crate::error::QbankError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let fx = setup();
        let (question, _) = fx.service.create_question(&grouped(&fx)).await.expect("create");

        assert!(fx.service.on_delete(&question).await.expect("first delete"));
        for id in IndexId::ALL {
            let namespace = id
                .summary_for(&question)
                .map(|entry| entry.namespace)
                .unwrap_or_default();
            assert_eq!(count(&fx, id, &namespace).await, 0, "{} not cleaned", id);
        }

        assert!(!fx.service.on_delete(&question).await.expect("second delete"));
        let report = fx.service.remove_from_indexes(&question).await;
        assert!(report
            .outcomes
            .iter()
            .all(|r| r.outcome == IndexOutcome::AlreadyAbsent));
    }
}
