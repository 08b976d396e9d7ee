//! SQLite 聚合索引后端
//!
//! 8 个索引共用 `aggregate_entries` 表，以 `index_name` 区分。
//! 随机抽样使用 `ORDER BY RANDOM() LIMIT n`，计数使用 `COUNT(*)`，
//! 均依赖 `(index_name, namespace, sort_key, question_id)` 主键索引。

use async_trait::async_trait;
use rusqlite::{params, Connection};
use std::sync::Arc;
use tracing::debug;

use super::{AggregateIndex, Bounds, IndexId, SummaryEntry};
use crate::database::QbankDatabase;
use crate::error::{IndexError, IndexResult};

pub struct SqliteAggregateIndex {
    db: Arc<QbankDatabase>,
    id: IndexId,
}

impl SqliteAggregateIndex {
    pub fn new(db: Arc<QbankDatabase>, id: IndexId) -> Self {
        Self { db, id }
    }

    /// 在阻塞线程池上取连接并执行同步 SQL，避免占用 tokio worker
    async fn run<T, F>(&self, op: F) -> IndexResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection, IndexId) -> IndexResult<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        let id = self.id;
        tokio::task::spawn_blocking(move || {
            let conn = db
                .get_conn_safe()
                .map_err(|e| IndexError::backend(id.name(), e))?;
            op(&conn, id)
        })
        .await
        .map_err(|e| IndexError::backend(id.name(), format!("blocking task failed: {}", e)))?
    }
}

fn backend_err(id: IndexId) -> impl Fn(rusqlite::Error) -> IndexError {
    move |err| IndexError::backend(id.name(), err)
}

fn missing(id: IndexId, entry: &SummaryEntry) -> IndexError {
    IndexError::EntryMissing {
        index: id.name().to_string(),
        key: entry.key(),
    }
}

const INSERT_SQL: &str = r#"
    INSERT OR IGNORE INTO aggregate_entries (index_name, namespace, sort_key, question_id)
    VALUES (?1, ?2, ?3, ?4)
"#;

const DELETE_SQL: &str = r#"
    DELETE FROM aggregate_entries
    WHERE index_name = ?1 AND namespace = ?2 AND sort_key = ?3 AND question_id = ?4
"#;

#[async_trait]
impl AggregateIndex for SqliteAggregateIndex {
    fn id(&self) -> IndexId {
        self.id
    }

    async fn insert(&self, entry: &SummaryEntry) -> IndexResult<()> {
        let entry = entry.clone();
        self.run(move |conn, id| {
            let affected = conn
                .execute(
                    INSERT_SQL,
                    params![id.name(), entry.namespace, entry.sort_key, entry.question_id],
                )
                .map_err(backend_err(id))?;

            if affected == 0 {
                return Err(IndexError::EntryExists {
                    index: id.name().to_string(),
                    key: entry.key(),
                });
            }
            Ok(())
        })
        .await
    }

    async fn delete(&self, entry: &SummaryEntry) -> IndexResult<()> {
        let entry = entry.clone();
        self.run(move |conn, id| {
            let affected = conn
                .execute(
                    DELETE_SQL,
                    params![id.name(), entry.namespace, entry.sort_key, entry.question_id],
                )
                .map_err(backend_err(id))?;

            if affected == 0 {
                return Err(missing(id, &entry));
            }
            Ok(())
        })
        .await
    }

    async fn replace(&self, old: &SummaryEntry, new: &SummaryEntry) -> IndexResult<()> {
        let (old, new) = (old.clone(), new.clone());
        self.run(move |conn, id| {
            let tx = conn.unchecked_transaction().map_err(backend_err(id))?;

            let removed = tx
                .execute(
                    DELETE_SQL,
                    params![id.name(), old.namespace, old.sort_key, old.question_id],
                )
                .map_err(backend_err(id))?;
            if removed == 0 {
                // tx 在 drop 时回滚
                return Err(missing(id, &old));
            }

            tx.execute(
                INSERT_SQL,
                params![id.name(), new.namespace, new.sort_key, new.question_id],
            )
            .map_err(backend_err(id))?;
            tx.commit().map_err(backend_err(id))?;
            Ok(())
        })
        .await
    }

    async fn count(&self, namespace: &str, bounds: &Bounds) -> IndexResult<u64> {
        let namespace = namespace.to_string();
        let bounds = bounds.clone();
        self.run(move |conn, id| {
            let mut sql = String::from(
                "SELECT COUNT(*) FROM aggregate_entries WHERE index_name = ?1 AND namespace = ?2",
            );
            let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> =
                vec![Box::new(id.name().to_string()), Box::new(namespace)];

            if let Some(lower) = bounds.lower {
                let op = if lower.inclusive { ">=" } else { ">" };
                sql.push_str(&format!(" AND sort_key {} ?{}", op, params_vec.len() + 1));
                params_vec.push(Box::new(lower.key));
            }
            if let Some(upper) = bounds.upper {
                let op = if upper.inclusive { "<=" } else { "<" };
                sql.push_str(&format!(" AND sort_key {} ?{}", op, params_vec.len() + 1));
                params_vec.push(Box::new(upper.key));
            }

            let params_refs: Vec<&dyn rusqlite::ToSql> =
                params_vec.iter().map(|p| p.as_ref()).collect();
            let count: i64 = conn
                .query_row(&sql, params_refs.as_slice(), |row| row.get(0))
                .map_err(backend_err(id))?;
            Ok(count.max(0) as u64)
        })
        .await
    }

    async fn random_sample(&self, namespace: &str, n: usize) -> IndexResult<Vec<String>> {
        if n == 0 {
            return Ok(Vec::new());
        }

        let namespace = namespace.to_string();
        self.run(move |conn, id| {
            let mut stmt = conn
                .prepare(
                    r#"
                    SELECT question_id FROM aggregate_entries
                    WHERE index_name = ?1 AND namespace = ?2
                    ORDER BY RANDOM()
                    LIMIT ?3
                    "#,
                )
                .map_err(backend_err(id))?;
            let rows = stmt
                .query_map(
                    params![id.name(), namespace, n.min(i64::MAX as usize) as i64],
                    |row| row.get::<_, String>(0),
                )
                .map_err(backend_err(id))?;
            let ids = rows
                .collect::<Result<Vec<String>, _>>()
                .map_err(backend_err(id))?;

            debug!(
                "[Qbank::SqliteIndex] {} sampled {}/{} from namespace='{}'",
                id,
                ids.len(),
                n,
                namespace
            );
            Ok(ids)
        })
        .await
    }

    async fn clear(&self, namespace: Option<&str>) -> IndexResult<u64> {
        let namespace = namespace.map(str::to_string);
        self.run(move |conn, id| {
            let affected = match namespace {
                Some(ns) => conn.execute(
                    "DELETE FROM aggregate_entries WHERE index_name = ?1 AND namespace = ?2",
                    params![id.name(), ns],
                ),
                None => conn.execute(
                    "DELETE FROM aggregate_entries WHERE index_name = ?1",
                    params![id.name()],
                ),
            }
            .map_err(backend_err(id))?;
            Ok(affected as u64)
        })
        .await
    }

    async fn namespaces(&self) -> IndexResult<Vec<String>> {
        self.run(|conn, id| {
            let mut stmt = conn
                .prepare(
                    "SELECT DISTINCT namespace FROM aggregate_entries WHERE index_name = ?1 ORDER BY namespace",
                )
                .map_err(backend_err(id))?;
            let rows = stmt
                .query_map(params![id.name()], |row| row.get::<_, String>(0))
                .map_err(backend_err(id))?;
            rows.collect::<Result<Vec<String>, _>>()
                .map_err(backend_err(id))
        })
        .await
    }
}
