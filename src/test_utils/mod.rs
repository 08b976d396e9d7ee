//! 测试工具：固定的播种数据与故障注入索引

mod database_seed;
mod faulty_index;

pub use database_seed::{seed_flat_corpus, seed_fracture_bank, FractureBank};
pub use faulty_index::FailingIndex;
