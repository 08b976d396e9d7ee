//! 主数据存储 Repo
//!
//! - `question_repo`：题目主表（单一事实来源）
//! - `taxonomy_repo`：三级分类
//! - `user_repo`：用户作答 / 收藏二级索引与按作用域的计数器

pub mod question_repo;
pub mod taxonomy_repo;
pub mod user_repo;

pub use question_repo::QuestionRepo;
pub use taxonomy_repo::{GroupLineage, TaxonomyRepo};
pub use user_repo::{UserRepo, UserScopeStats};

use tracing::warn;

/// Log row-parse errors instead of silently discarding them.
pub(crate) fn log_and_skip_err<T>(result: Result<T, rusqlite::Error>) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(e) => {
            warn!("[Qbank::Repo] Row parse error (skipped): {}", e);
            None
        }
    }
}

/// 生成 `?start, ?start+1, ...` 形式的占位符列表
pub(crate) fn placeholders(count: usize, start: usize) -> String {
    (0..count)
        .map(|i| format!("?{}", start + i))
        .collect::<Vec<_>>()
        .join(", ")
}
