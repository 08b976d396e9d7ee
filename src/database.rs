//! 题库数据库管理模块
//!
//! 提供主题目表、分类表、用户二级索引以及 SQLite 聚合索引表的初始化和连接管理。
//! 使用 r2d2 连接池，支持并发访问。
//!
//! ## 迁移系统
//! Schema 由 Refinery 嵌入式迁移维护，迁移文件位于 `migrations/qbank/` 目录。

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::QbankConfig;
use crate::error::{QbankError, QbankResult};

/// 数据库文件名
const DATABASE_FILENAME: &str = "qbank.db";

mod embedded {
    refinery::embed_migrations!("migrations/qbank");
}

/// SQLite 连接池类型
pub type QbankPool = Pool<SqliteConnectionManager>;

/// SQLite 池化连接类型
pub type QbankPooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// 连接池参数
#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    pub max_size: u32,
    pub busy_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_size: 8,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&QbankConfig> for PoolOptions {
    fn from(cfg: &QbankConfig) -> Self {
        Self {
            max_size: cfg.pool_max_size,
            busy_timeout: cfg.busy_timeout(),
        }
    }
}

/// 题库数据库管理器
///
/// 管理 `qbank.db`：
/// - r2d2 连接池
/// - 启动时执行嵌入式迁移
/// - WAL 模式提升并发读性能
pub struct QbankDatabase {
    pool: QbankPool,
    db_path: PathBuf,
}

impl QbankDatabase {
    /// 在 `data_dir/databases` 下打开（或创建）数据库
    pub fn new(data_dir: &Path) -> QbankResult<Self> {
        Self::with_options(data_dir, PoolOptions::default())
    }

    pub fn with_options(data_dir: &Path, options: PoolOptions) -> QbankResult<Self> {
        info!(
            "[Qbank::Database] Initializing database in: {}",
            data_dir.display()
        );

        let databases_dir = data_dir.join("databases");
        if let Err(e) = fs::create_dir_all(&databases_dir) {
            error!(
                "[Qbank::Database] Failed to create databases directory: {}",
                e
            );
            return Err(QbankError::Io(format!(
                "Failed to create databases directory: {}",
                e
            )));
        }

        let db_path = databases_dir.join(DATABASE_FILENAME);
        let pool = Self::build_pool(&db_path, options)?;
        let db = Self { pool, db_path };
        db.run_migrations()?;

        info!(
            "[Qbank::Database] Database initialized successfully: {}",
            db.db_path.display()
        );

        Ok(db)
    }

    fn build_pool(db_path: &Path, options: PoolOptions) -> QbankResult<QbankPool> {
        debug!(
            "[Qbank::Database] Building connection pool for: {}",
            db_path.display()
        );

        let busy_timeout_ms = options.busy_timeout.as_millis() as i64;
        let manager = SqliteConnectionManager::file(db_path).with_init(move |conn| {
            conn.pragma_update(None, "foreign_keys", "ON")?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn.pragma_update(None, "busy_timeout", busy_timeout_ms)?;
            Ok(())
        });

        Pool::builder()
            .max_size(options.max_size.max(1))
            .connection_timeout(Duration::from_secs(5))
            .idle_timeout(Some(Duration::from_secs(600)))
            .build(manager)
            .map_err(|e| QbankError::Pool(format!("Failed to create connection pool: {}", e)))
    }

    fn run_migrations(&self) -> QbankResult<()> {
        let mut conn = self.get_conn()?;
        let report = embedded::migrations::runner()
            .set_grouped(false)
            .run(&mut *conn)
            .map_err(|e| QbankError::Migration(e.to_string()))?;

        let applied = report.applied_migrations().len();
        if applied > 0 {
            info!("[Qbank::Database] Applied {} migration(s)", applied);
        }
        Ok(())
    }

    /// 获取数据库连接
    pub fn get_conn(&self) -> QbankResult<QbankPooledConnection> {
        self.pool
            .get()
            .map_err(|e| QbankError::Pool(format!("Failed to get connection: {}", e)))
    }

    /// 获取数据库连接（带重试，连接池繁忙时最多重试 3 次）
    pub fn get_conn_safe(&self) -> QbankResult<QbankPooledConnection> {
        const MAX_RETRIES: usize = 3;
        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            match self.pool.get() {
                Ok(conn) => {
                    if attempt > 0 {
                        debug!(
                            "[Qbank::Database] get_conn_safe: succeeded on retry attempt {}",
                            attempt
                        );
                    }
                    return Ok(conn);
                }
                Err(e) => {
                    warn!(
                        "[Qbank::Database] get_conn_safe: attempt {} failed: {}",
                        attempt + 1,
                        e
                    );
                    last_error = Some(e);
                    if attempt < MAX_RETRIES - 1 {
                        let backoff_ms = 50u64.saturating_mul(1u64 << attempt);
                        std::thread::sleep(Duration::from_millis(backoff_ms));
                    }
                }
            }
        }

        error!(
            "[Qbank::Database] get_conn_safe: all {} attempts failed",
            MAX_RETRIES
        );
        Err(QbankError::Pool(format!(
            "Failed to get connection after {} retries: {}",
            MAX_RETRIES,
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "Unknown error".to_string())
        )))
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_database_creates_schema() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db = QbankDatabase::new(temp_dir.path()).expect("Failed to create database");
        assert!(db.db_path().exists());

        let conn = db.get_conn_safe().expect("conn");
        for table in [
            "themes",
            "subthemes",
            "question_groups",
            "questions",
            "user_answers",
            "user_bookmarks",
            "user_scope_stats",
            "aggregate_entries",
        ] {
            let exists: bool = conn
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name=?1)",
                    [table],
                    |row| row.get(0),
                )
                .expect("query");
            assert!(exists, "table {} should exist", table);
        }
    }

    #[test]
    fn test_reopen_is_idempotent() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        {
            let _db = QbankDatabase::new(temp_dir.path()).expect("first open");
        }
        let db = QbankDatabase::new(temp_dir.path()).expect("second open");
        assert!(db.get_conn().is_ok());
    }
}
