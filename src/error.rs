//! 题库聚合核心统一错误类型
//!
//! - [`QbankError`]：主数据写入、查询与契约违规（致命，向调用方传播）
//! - [`IndexError`]：聚合索引原语的错误，其中 `EntryMissing` 是可恢复的预期情况

use serde::Serialize;
use thiserror::Error;

/// 题库核心操作结果类型别名
pub type QbankResult<T> = Result<T, QbankError>;

/// 聚合索引操作结果类型别名
pub type IndexResult<T> = Result<T, IndexError>;

/// 聚合索引原语错误
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
pub enum IndexError {
    /// 目标条目不在索引中（通常是之前某次扇出写入失败导致）
    #[error("Entry missing in index '{index}': {key}")]
    EntryMissing { index: String, key: String },

    /// 条目已存在（重复插入）
    #[error("Entry already exists in index '{index}': {key}")]
    EntryExists { index: String, key: String },

    /// 后端错误（数据库、连接池等瞬时故障）
    #[error("Index backend error in '{index}': {message}")]
    Backend { index: String, message: String },
}

impl IndexError {
    pub fn is_entry_missing(&self) -> bool {
        matches!(self, IndexError::EntryMissing { .. })
    }

    pub fn is_entry_exists(&self) -> bool {
        matches!(self, IndexError::EntryExists { .. })
    }

    pub fn backend(index: impl Into<String>, message: impl ToString) -> Self {
        IndexError::Backend {
            index: index.into(),
            message: message.to_string(),
        }
    }
}

/// 题库核心统一错误类型
#[derive(Debug, Error, Serialize)]
pub enum QbankError {
    /// 数据库错误
    #[error("Database error: {0}")]
    Database(String),

    /// 连接池错误
    #[error("Connection pool error: {0}")]
    Pool(String),

    /// 资源未找到
    #[error("{resource_type} not found: {id}")]
    NotFound { resource_type: String, id: String },

    /// 未知的组卷模式（调用方契约违规）
    #[error("Invalid quiz mode: {0}")]
    InvalidMode(String),

    /// 题目的分类层级不一致（group 不属于 subtheme，或 subtheme 不属于 theme）
    #[error("Invalid taxonomy placement for question '{question_id}': {reason}")]
    InvalidTaxonomy { question_id: String, reason: String },

    /// 无效参数
    #[error("Invalid argument '{param}': {reason}")]
    InvalidArgument { param: String, reason: String },

    /// 迁移错误
    #[error("Migration error: {0}")]
    Migration(String),

    /// 配置错误
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO 错误
    #[error("IO error: {0}")]
    Io(String),

    /// 聚合索引错误（只在读路径或对账任务中向上传播）
    #[error("Aggregate index error: {0}")]
    Index(#[from] IndexError),

    /// 其他错误
    #[error("{0}")]
    Other(String),
}

impl QbankError {
    pub fn not_found(resource_type: &str, id: impl Into<String>) -> Self {
        QbankError::NotFound {
            resource_type: resource_type.to_string(),
            id: id.into(),
        }
    }
}

impl From<rusqlite::Error> for QbankError {
    fn from(err: rusqlite::Error) -> Self {
        QbankError::Database(err.to_string())
    }
}

impl From<r2d2::Error> for QbankError {
    fn from(err: r2d2::Error) -> Self {
        QbankError::Pool(err.to_string())
    }
}

impl From<std::io::Error> for QbankError {
    fn from(err: std::io::Error) -> Self {
        QbankError::Io(err.to_string())
    }
}

impl From<config::ConfigError> for QbankError {
    fn from(err: config::ConfigError) -> Self {
        QbankError::Configuration(err.to_string())
    }
}

// 转换为 String（用于命令层返回）
impl From<QbankError> for String {
    fn from(err: QbankError) -> Self {
        err.to_string()
    }
}
