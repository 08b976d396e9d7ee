/// 故障注入：所有操作都返回后端错误的聚合索引
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::aggregates::{AggregateIndex, Bounds, IndexId, SummaryEntry};
use crate::error::{IndexError, IndexResult};

pub struct FailingIndex {
    id: IndexId,
    calls: AtomicUsize,
}

impl FailingIndex {
    pub fn new(id: IndexId) -> Self {
        Self {
            id,
            calls: AtomicUsize::new(0),
        }
    }

    /// 被调用的次数
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn fail<T>(&self, op: &str) -> IndexResult<T> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(IndexError::backend(
            self.id.name(),
            format!("injected failure on {}", op),
        ))
    }
}

#[async_trait]
impl AggregateIndex for FailingIndex {
    fn id(&self) -> IndexId {
        self.id
    }

    async fn insert(&self, _entry: &SummaryEntry) -> IndexResult<()> {
        self.fail("insert")
    }

    async fn delete(&self, _entry: &SummaryEntry) -> IndexResult<()> {
        self.fail("delete")
    }

    async fn replace(&self, _old: &SummaryEntry, _new: &SummaryEntry) -> IndexResult<()> {
        self.fail("replace")
    }

    async fn count(&self, _namespace: &str, _bounds: &Bounds) -> IndexResult<u64> {
        self.fail("count")
    }

    async fn random_sample(&self, _namespace: &str, _n: usize) -> IndexResult<Vec<String>> {
        self.fail("random_sample")
    }

    async fn clear(&self, _namespace: Option<&str>) -> IndexResult<u64> {
        self.fail("clear")
    }

    async fn namespaces(&self) -> IndexResult<Vec<String>> {
        self.fail("namespaces")
    }
}
