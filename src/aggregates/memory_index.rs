//! 进程内聚合索引
//!
//! 每个命名空间一个有序集合，分片存放在 `DashMap` 中。
//! 抽样为 O(n) 的 `choose_multiple`，适合测试和中小规模题库。

use async_trait::async_trait;
use dashmap::DashMap;
use rand::seq::SliceRandom;
use std::collections::BTreeSet;

use super::{AggregateIndex, Bounds, IndexId, SummaryEntry};
use crate::error::{IndexError, IndexResult};

/// (sort_key, question_id)
type Member = (String, String);

pub struct MemoryAggregateIndex {
    id: IndexId,
    namespaces: DashMap<String, BTreeSet<Member>>,
}

impl MemoryAggregateIndex {
    pub fn new(id: IndexId) -> Self {
        Self {
            id,
            namespaces: DashMap::new(),
        }
    }

    fn member(entry: &SummaryEntry) -> Member {
        (entry.sort_key.clone(), entry.question_id.clone())
    }

    fn remove(&self, entry: &SummaryEntry) -> bool {
        let member = Self::member(entry);
        let removed = self
            .namespaces
            .get_mut(&entry.namespace)
            .map(|mut set| set.remove(&member))
            .unwrap_or(false);
        if removed {
            self.namespaces
                .remove_if(&entry.namespace, |_, set| set.is_empty());
        }
        removed
    }

    fn add(&self, entry: &SummaryEntry) -> bool {
        self.namespaces
            .entry(entry.namespace.clone())
            .or_default()
            .insert(Self::member(entry))
    }
}

#[async_trait]
impl AggregateIndex for MemoryAggregateIndex {
    fn id(&self) -> IndexId {
        self.id
    }

    async fn insert(&self, entry: &SummaryEntry) -> IndexResult<()> {
        if self.add(entry) {
            Ok(())
        } else {
            Err(IndexError::EntryExists {
                index: self.id.name().to_string(),
                key: entry.key(),
            })
        }
    }

    async fn delete(&self, entry: &SummaryEntry) -> IndexResult<()> {
        if self.remove(entry) {
            Ok(())
        } else {
            Err(IndexError::EntryMissing {
                index: self.id.name().to_string(),
                key: entry.key(),
            })
        }
    }

    // 跨命名空间替换时两步之间不持有分片锁，读者可能短暂看到 old 已删、new 未插入
    async fn replace(&self, old: &SummaryEntry, new: &SummaryEntry) -> IndexResult<()> {
        if !self.remove(old) {
            return Err(IndexError::EntryMissing {
                index: self.id.name().to_string(),
                key: old.key(),
            });
        }
        self.add(new);
        Ok(())
    }

    async fn count(&self, namespace: &str, bounds: &Bounds) -> IndexResult<u64> {
        let count = self
            .namespaces
            .get(namespace)
            .map(|set| {
                set.iter()
                    .filter(|(sort_key, _)| bounds.contains(sort_key))
                    .count()
            })
            .unwrap_or(0);
        Ok(count as u64)
    }

    async fn random_sample(&self, namespace: &str, n: usize) -> IndexResult<Vec<String>> {
        let Some(set) = self.namespaces.get(namespace) else {
            return Ok(Vec::new());
        };
        let members: Vec<&Member> = set.iter().collect();
        let mut rng = rand::thread_rng();
        Ok(members
            .choose_multiple(&mut rng, n)
            .map(|(_, question_id)| question_id.clone())
            .collect())
    }

    async fn clear(&self, namespace: Option<&str>) -> IndexResult<u64> {
        let removed = match namespace {
            Some(ns) => self
                .namespaces
                .remove(ns)
                .map(|(_, set)| set.len())
                .unwrap_or(0),
            None => {
                let total = self.namespaces.iter().map(|set| set.len()).sum();
                self.namespaces.clear();
                total
            }
        };
        Ok(removed as u64)
    }

    async fn namespaces(&self) -> IndexResult<Vec<String>> {
        let mut names: Vec<String> = self
            .namespaces
            .iter()
            .filter(|shard| !shard.value().is_empty())
            .map(|shard| shard.key().clone())
            .collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Scope;
    use assert_matches::assert_matches;
    use std::collections::HashSet;

    fn entry(group: &str, question: &str) -> SummaryEntry {
        SummaryEntry::new(&Scope::Group(group.to_string()), question)
    }

    #[tokio::test]
    async fn test_insert_delete_roundtrip_semantics() {
        let index = MemoryAggregateIndex::new(IndexId::COUNT_BY_GROUP);
        index.insert(&entry("g1", "q1")).await.expect("insert");
        assert_matches!(
            index.insert(&entry("g1", "q1")).await,
            Err(IndexError::EntryExists { .. })
        );
        assert_eq!(index.count("g1", &Bounds::unbounded()).await.expect("count"), 1);

        index.delete(&entry("g1", "q1")).await.expect("delete");
        assert_matches!(
            index.delete(&entry("g1", "q1")).await,
            Err(IndexError::EntryMissing { .. })
        );
        assert_eq!(index.count("g1", &Bounds::unbounded()).await.expect("count"), 0);
    }

    #[tokio::test]
    async fn test_replace_moves_between_namespaces() {
        let index = MemoryAggregateIndex::new(IndexId::RANDOM_BY_GROUP);
        assert_matches!(
            index.replace(&entry("g1", "q1"), &entry("g2", "q1")).await,
            Err(IndexError::EntryMissing { .. })
        );

        index.insert(&entry("g1", "q1")).await.expect("insert");
        index
            .replace(&entry("g1", "q1"), &entry("g2", "q1"))
            .await
            .expect("replace");
        assert_eq!(
            index.random_sample("g2", 5).await.expect("sample"),
            vec!["q1".to_string()]
        );
        assert!(index.random_sample("g1", 5).await.expect("sample").is_empty());
    }

    #[tokio::test]
    async fn test_random_sample_is_bounded_and_distinct() {
        let index = MemoryAggregateIndex::new(IndexId::RANDOM_GLOBAL);
        for i in 0..50 {
            index
                .insert(&SummaryEntry::new(&Scope::Global, &format!("q{}", i)))
                .await
                .expect("insert");
        }
        let sample = index.random_sample("", 20).await.expect("sample");
        assert_eq!(sample.len(), 20);
        assert_eq!(sample.iter().collect::<HashSet<_>>().len(), 20);

        assert_eq!(index.clear(None).await.expect("clear"), 50);
        assert!(index.random_sample("", 20).await.expect("sample").is_empty());
    }

    #[tokio::test]
    async fn test_namespaces_drop_when_emptied() {
        let index = MemoryAggregateIndex::new(IndexId::COUNT_BY_GROUP);
        index.insert(&entry("g2", "q1")).await.expect("insert");
        index.insert(&entry("g1", "q2")).await.expect("insert");
        assert_eq!(
            index.namespaces().await.expect("namespaces"),
            vec!["g1".to_string(), "g2".to_string()]
        );

        index.delete(&entry("g2", "q1")).await.expect("delete");
        assert_eq!(
            index.namespaces().await.expect("namespaces"),
            vec!["g1".to_string()]
        );
    }
}
