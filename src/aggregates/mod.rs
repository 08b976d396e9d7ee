//! 聚合索引
//!
//! 聚合索引是主题目表的非规范化摘要，回答两类查询：
//! - 按作用域的精确计数（`count`）
//! - 按作用域的无放回近似均匀随机抽样（`random_sample`）
//!
//! 共 8 个命名实例，由 [`IndexId`]（计数 / 随机 × 全局 / theme / subtheme / group）标识。
//! 底层的顺序统计结构只通过 [`AggregateIndex`] trait 暴露契约，可替换为任意实现：
//! - [`SqliteAggregateIndex`]：持久化在主库的 `aggregate_entries` 表
//! - [`MemoryAggregateIndex`]：进程内实现，重启后需要对账任务重建

mod memory_index;
mod sqlite_index;

pub use memory_index::MemoryAggregateIndex;
pub use sqlite_index::SqliteAggregateIndex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::config::IndexBackend;
use crate::database::QbankDatabase;
use crate::error::{IndexResult, QbankError, QbankResult};
use crate::models::{Question, Scope, ScopeKind};

// ============================================================================
// 索引标识
// ============================================================================

/// 索引用途
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AggregateKind {
    Count,
    Random,
}

/// 8 个聚合索引之一
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub struct IndexId {
    pub kind: AggregateKind,
    pub scope: ScopeKind,
}

impl IndexId {
    pub const TOTAL_COUNT: IndexId = IndexId::new(AggregateKind::Count, ScopeKind::Global);
    pub const COUNT_BY_THEME: IndexId = IndexId::new(AggregateKind::Count, ScopeKind::Theme);
    pub const COUNT_BY_SUBTHEME: IndexId = IndexId::new(AggregateKind::Count, ScopeKind::Subtheme);
    pub const COUNT_BY_GROUP: IndexId = IndexId::new(AggregateKind::Count, ScopeKind::Group);
    pub const RANDOM_GLOBAL: IndexId = IndexId::new(AggregateKind::Random, ScopeKind::Global);
    pub const RANDOM_BY_THEME: IndexId = IndexId::new(AggregateKind::Random, ScopeKind::Theme);
    pub const RANDOM_BY_SUBTHEME: IndexId =
        IndexId::new(AggregateKind::Random, ScopeKind::Subtheme);
    pub const RANDOM_BY_GROUP: IndexId = IndexId::new(AggregateKind::Random, ScopeKind::Group);

    pub const ALL: [IndexId; 8] = [
        IndexId::TOTAL_COUNT,
        IndexId::COUNT_BY_THEME,
        IndexId::COUNT_BY_SUBTHEME,
        IndexId::COUNT_BY_GROUP,
        IndexId::RANDOM_GLOBAL,
        IndexId::RANDOM_BY_THEME,
        IndexId::RANDOM_BY_SUBTHEME,
        IndexId::RANDOM_BY_GROUP,
    ];

    pub const fn new(kind: AggregateKind, scope: ScopeKind) -> Self {
        Self { kind, scope }
    }

    /// 在 `ALL` 中的位置
    pub const fn ordinal(&self) -> usize {
        let base = match self.kind {
            AggregateKind::Count => 0,
            AggregateKind::Random => 4,
        };
        let offset = match self.scope {
            ScopeKind::Global => 0,
            ScopeKind::Theme => 1,
            ScopeKind::Subtheme => 2,
            ScopeKind::Group => 3,
        };
        base + offset
    }

    /// 持久化名称（SQLite 后端的 index_name 列）
    pub fn name(&self) -> &'static str {
        match (self.kind, self.scope) {
            (AggregateKind::Count, ScopeKind::Global) => "total_count",
            (AggregateKind::Count, ScopeKind::Theme) => "count_by_theme",
            (AggregateKind::Count, ScopeKind::Subtheme) => "count_by_subtheme",
            (AggregateKind::Count, ScopeKind::Group) => "count_by_group",
            (AggregateKind::Random, ScopeKind::Global) => "random_global",
            (AggregateKind::Random, ScopeKind::Theme) => "random_by_theme",
            (AggregateKind::Random, ScopeKind::Subtheme) => "random_by_subtheme",
            (AggregateKind::Random, ScopeKind::Group) => "random_by_group",
        }
    }

    /// 某粒度下的两个索引（计数 + 随机）
    pub fn pair_for(scope: ScopeKind) -> [IndexId; 2] {
        [
            IndexId::new(AggregateKind::Count, scope),
            IndexId::new(AggregateKind::Random, scope),
        ]
    }

    /// 题目在该索引中的摘要条目；题目缺少该索引的作用域字段时返回 None
    pub fn summary_for(&self, question: &Question) -> Option<SummaryEntry> {
        self.scope
            .scope_of(question)
            .map(|scope| SummaryEntry::new(&scope, &question.id))
    }
}

impl fmt::Display for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// 摘要条目与边界
// ============================================================================

/// 聚合索引中的摘要条目
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub struct SummaryEntry {
    /// 作用域 ID；全局索引为空字符串
    pub namespace: String,
    /// 排序键（题目 ID）
    pub sort_key: String,
    pub question_id: String,
}

impl SummaryEntry {
    pub fn new(scope: &Scope, question_id: &str) -> Self {
        Self {
            namespace: scope.namespace().to_string(),
            sort_key: question_id.to_string(),
            question_id: question_id.to_string(),
        }
    }

    /// 日志 / 错误信息中使用的键
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.sort_key)
    }
}

/// 排序键上的单侧边界
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyBound {
    pub key: String,
    pub inclusive: bool,
}

/// `count` 的排序键范围，默认不设边界
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Bounds {
    pub lower: Option<KeyBound>,
    pub upper: Option<KeyBound>,
}

impl Bounds {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn contains(&self, sort_key: &str) -> bool {
        let above = match &self.lower {
            Some(b) if b.inclusive => sort_key >= b.key.as_str(),
            Some(b) => sort_key > b.key.as_str(),
            None => true,
        };
        let below = match &self.upper {
            Some(b) if b.inclusive => sort_key <= b.key.as_str(),
            Some(b) => sort_key < b.key.as_str(),
            None => true,
        };
        above && below
    }
}

// ============================================================================
// 索引原语契约
// ============================================================================

/// 聚合索引原语
///
/// 实现需自行保证并发插入 / 删除的串行化。
#[async_trait]
pub trait AggregateIndex: Send + Sync {
    fn id(&self) -> IndexId;

    /// 插入条目；条目已存在时返回 `IndexError::EntryExists`
    async fn insert(&self, entry: &SummaryEntry) -> IndexResult<()>;

    /// 删除条目；条目不存在时返回 `IndexError::EntryMissing`
    async fn delete(&self, entry: &SummaryEntry) -> IndexResult<()>;

    /// 原子替换；`old` 不存在时返回 `IndexError::EntryMissing` 且不写入 `new`
    async fn replace(&self, old: &SummaryEntry, new: &SummaryEntry) -> IndexResult<()>;

    /// 命名空间内、排序键落在 `bounds` 内的条目数
    async fn count(&self, namespace: &str, bounds: &Bounds) -> IndexResult<u64>;

    /// 从命名空间内无放回地抽取至多 `n` 个题目 ID
    async fn random_sample(&self, namespace: &str, n: usize) -> IndexResult<Vec<String>>;

    /// 清空命名空间（None 表示整个索引），返回删除的条目数
    async fn clear(&self, namespace: Option<&str>) -> IndexResult<u64>;

    /// 至少持有一个条目的命名空间
    async fn namespaces(&self) -> IndexResult<Vec<String>>;
}

// ============================================================================
// 8 个索引实例的集合
// ============================================================================

/// 8 个命名聚合索引
#[derive(Clone)]
pub struct AggregateSet {
    indexes: Vec<Arc<dyn AggregateIndex>>,
}

impl AggregateSet {
    /// 由调用方提供的 8 个实例组装；缺失或重复的 IndexId 视为配置错误
    pub fn from_indexes(indexes: Vec<Arc<dyn AggregateIndex>>) -> QbankResult<Self> {
        let mut ordered: Vec<Arc<dyn AggregateIndex>> = Vec::with_capacity(IndexId::ALL.len());
        for id in IndexId::ALL {
            let mut matching = indexes.iter().filter(|index| index.id() == id);
            let index = matching.next().ok_or_else(|| {
                QbankError::Configuration(format!("aggregate index '{}' is not registered", id))
            })?;
            if matching.next().is_some() {
                return Err(QbankError::Configuration(format!(
                    "aggregate index '{}' registered twice",
                    id
                )));
            }
            ordered.push(Arc::clone(index));
        }
        Ok(Self { indexes: ordered })
    }

    /// 使用主库 `aggregate_entries` 表的 SQLite 后端
    pub fn sqlite(db: Arc<QbankDatabase>) -> Self {
        Self {
            indexes: IndexId::ALL
                .iter()
                .map(|id| {
                    Arc::new(SqliteAggregateIndex::new(Arc::clone(&db), *id))
                        as Arc<dyn AggregateIndex>
                })
                .collect(),
        }
    }

    /// 进程内后端
    pub fn in_memory() -> Self {
        Self {
            indexes: IndexId::ALL
                .iter()
                .map(|id| Arc::new(MemoryAggregateIndex::new(*id)) as Arc<dyn AggregateIndex>)
                .collect(),
        }
    }

    /// 按配置选择后端
    pub fn for_backend(backend: IndexBackend, db: Arc<QbankDatabase>) -> Self {
        match backend {
            IndexBackend::Sqlite => Self::sqlite(db),
            IndexBackend::Memory => Self::in_memory(),
        }
    }

    pub fn get(&self, id: IndexId) -> &Arc<dyn AggregateIndex> {
        &self.indexes[id.ordinal()]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn AggregateIndex>> {
        self.indexes.iter()
    }

    pub fn counter(&self, scope: ScopeKind) -> &Arc<dyn AggregateIndex> {
        self.get(IndexId::new(AggregateKind::Count, scope))
    }

    pub fn sampler(&self, scope: ScopeKind) -> &Arc<dyn AggregateIndex> {
        self.get(IndexId::new(AggregateKind::Random, scope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn question(group: Option<&str>) -> Question {
        Question {
            id: "q1".to_string(),
            title: "t".to_string(),
            question_text: "x".to_string(),
            explanation: None,
            theme_id: "t1".to_string(),
            subtheme_id: group.map(|_| "s1".to_string()),
            group_id: group.map(str::to_string),
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn test_index_names_are_unique() {
        let names: std::collections::HashSet<&str> =
            IndexId::ALL.iter().map(IndexId::name).collect();
        assert_eq!(names.len(), 8);
    }

    #[test]
    fn test_summary_dispatch_by_scope_kind() {
        let ungrouped = question(None);
        assert!(IndexId::TOTAL_COUNT.summary_for(&ungrouped).is_some());
        assert!(IndexId::RANDOM_BY_THEME.summary_for(&ungrouped).is_some());
        assert!(IndexId::COUNT_BY_SUBTHEME.summary_for(&ungrouped).is_none());
        assert!(IndexId::RANDOM_BY_GROUP.summary_for(&ungrouped).is_none());

        let grouped = question(Some("g1"));
        let applicable = IndexId::ALL
            .iter()
            .filter(|id| id.summary_for(&grouped).is_some())
            .count();
        assert_eq!(applicable, 8);

        let entry = IndexId::COUNT_BY_GROUP
            .summary_for(&grouped)
            .expect("group entry");
        assert_eq!(entry.namespace, "g1");
        assert_eq!(entry.question_id, "q1");
    }

    #[test]
    fn test_bounds_contains() {
        let bounds = Bounds {
            lower: Some(KeyBound {
                key: "b".to_string(),
                inclusive: true,
            }),
            upper: Some(KeyBound {
                key: "d".to_string(),
                inclusive: false,
            }),
        };
        assert!(!bounds.contains("a"));
        assert!(bounds.contains("b"));
        assert!(bounds.contains("c"));
        assert!(!bounds.contains("d"));
        assert!(Bounds::unbounded().contains("anything"));
    }

    #[test]
    fn test_ordinal_matches_all_order() {
        for (position, id) in IndexId::ALL.iter().enumerate() {
            assert_eq!(id.ordinal(), position);
        }
    }

    #[test]
    fn test_from_indexes_rejects_incomplete_set() {
        let partial: Vec<Arc<dyn AggregateIndex>> =
            vec![Arc::new(MemoryAggregateIndex::new(IndexId::TOTAL_COUNT))];
        assert!(AggregateSet::from_indexes(partial).is_err());

        let full: Vec<Arc<dyn AggregateIndex>> = IndexId::ALL
            .iter()
            .rev()
            .map(|id| Arc::new(MemoryAggregateIndex::new(*id)) as Arc<dyn AggregateIndex>)
            .collect();
        let set = AggregateSet::from_indexes(full).expect("complete set");
        assert_eq!(set.get(IndexId::COUNT_BY_THEME).id(), IndexId::COUNT_BY_THEME);
    }

    #[test]
    fn test_aggregate_set_lookup() {
        let set = AggregateSet::in_memory();
        assert_eq!(set.counter(ScopeKind::Group).id(), IndexId::COUNT_BY_GROUP);
        assert_eq!(set.sampler(ScopeKind::Global).id(), IndexId::RANDOM_GLOBAL);
        assert_eq!(set.iter().count(), 8);
    }
}
