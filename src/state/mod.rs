//! 状态层：KV 存储后端、检查点、事务与历史记录

pub mod file_store;
pub mod manager;
pub mod memory_store;
pub mod store;

pub use file_store::FileStateStore;
pub use manager::{StateError, StateManager, StateMetrics, StateSnapshot, StateTransaction};
pub use memory_store::MemoryStateStore;
pub use store::{StateStore, StoredEnvelope};
