//! 运行配置
//!
//! 加载顺序：`.env`（dotenvy）→ `config/qbank.toml`（可选）→ `QBANK__*` 环境变量。

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::QbankResult;

/// 默认配置文件（不含扩展名，由 config crate 自动识别格式）
const DEFAULT_CONFIG_FILE: &str = "config/qbank";

/// 聚合索引的存储后端
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum IndexBackend {
    /// 与主库共用 SQLite 文件（aggregate_entries 表）
    #[default]
    Sqlite,
    /// 进程内索引，重启后需要 rebuild
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QbankConfig {
    /// 数据目录，数据库文件位于 `<data_dir>/databases/qbank.db`
    pub data_dir: PathBuf,
    pub pool_max_size: u32,
    pub busy_timeout_ms: u64,
    pub index_backend: IndexBackend,
    /// tracing EnvFilter 指令，例如 `info,qbank_aggregates_lib=debug`
    pub log_filter: String,
}

impl Default for QbankConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            pool_max_size: 8,
            busy_timeout_ms: 5000,
            index_backend: IndexBackend::Sqlite,
            log_filter: "info".to_string(),
        }
    }
}

impl QbankConfig {
    pub fn from_env_and_file() -> QbankResult<Self> {
        dotenvy::dotenv().ok();
        let file = if Path::new(&format!("{}.toml", DEFAULT_CONFIG_FILE)).exists() {
            Some(DEFAULT_CONFIG_FILE)
        } else {
            None
        };
        Self::load(file)
    }

    /// 从指定配置文件（可选）和环境变量加载，环境变量优先
    pub fn load(file: Option<&str>) -> QbankResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(name) = file {
            builder = builder.add_source(config::File::with_name(name).required(false));
        }
        let loaded = builder
            .add_source(
                config::Environment::with_prefix("QBANK")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;
        let cfg: QbankConfig = loaded.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> QbankResult<()> {
        if self.pool_max_size == 0 {
            return Err(crate::error::QbankError::Configuration(
                "pool_max_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let cfg = QbankConfig::default();
        assert_eq!(cfg.index_backend, IndexBackend::Sqlite);
        assert_eq!(cfg.busy_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("qbank.toml");
        let mut file = std::fs::File::create(&path).expect("Failed to create config");
        writeln!(file, "pool_max_size = 3\nindex_backend = \"memory\"").expect("write");

        let name = dir.path().join("qbank");
        let cfg = QbankConfig::load(Some(name.to_str().expect("utf8 path"))).expect("load");
        assert_eq!(cfg.pool_max_size, 3);
        assert_eq!(cfg.index_backend, IndexBackend::Memory);
        assert_eq!(cfg.log_filter, "info");
    }

    #[test]
    fn test_rejects_empty_pool() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "pool_max_size = 0\n").expect("write");

        let name = dir.path().join("bad");
        let result = QbankConfig::load(Some(name.to_str().expect("utf8 path")));
        assert!(result.is_err());
    }

    #[test]
    fn test_env_overrides_file() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("qbank.toml");
        std::fs::write(&path, "busy_timeout_ms = 1000\n").expect("write");

        // 其他测试不读取 busy_timeout_ms
        std::env::set_var("QBANK__BUSY_TIMEOUT_MS", "2500");
        let name = dir.path().join("qbank");
        let result = QbankConfig::load(Some(name.to_str().expect("utf8 path")));
        std::env::remove_var("QBANK__BUSY_TIMEOUT_MS");

        let cfg = result.expect("load");
        assert_eq!(cfg.busy_timeout_ms, 2500);
    }
}
