// Qbank aggregates library entry
// 题库聚合核心：聚合索引同步、作用域解析、随机抽题与组卷。

pub mod aggregate_sync;
pub mod aggregates;
pub mod config;
pub mod counts;
pub mod database;
pub mod error;
pub mod mode_filter;
pub mod models;
pub mod quiz_builder;
pub mod reconcile;
pub mod repos;
pub mod sampling;
pub mod scope_resolver;
pub mod test_utils;

pub use aggregate_sync::{AggregateSyncService, IndexOutcome, SyncReport};
pub use aggregates::{AggregateIndex, AggregateSet, IndexId};
pub use config::QbankConfig;
pub use database::QbankDatabase;
pub use error::{IndexError, QbankError, QbankResult};
pub use mode_filter::QuizMode;
pub use quiz_builder::{CollectRequest, QuizQuestionCollector};
