//! 缓存层：带预算的 LRU 缓存与性能优化器

pub mod lru;
pub mod optimizer;

pub use lru::{CacheEntry, CacheStats, CachedValue, EvictingCache};
pub use optimizer::{PerformanceMetrics, PerformanceOptimizer};
