//! 带双预算的 LRU 缓存
//!
//! 条目数与总字节数两个预算同时生效：set 之后只要任一超限，
//! 就从最久未使用端逐条淘汰（未过期也淘汰）。命中会把条目提升为
//! 最近使用并累加 hit_count；过期条目在读取时删除并按未命中处理。
//! 淘汰决策在单把锁内完成，保证字节计数一致。

use chrono::{DateTime, Utc};
use lru::LruCache as LruMap;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::config::CacheSection;

/// 缓存值：结构化 JSON 或原始字节（截图等二进制）
#[derive(Debug, Clone, PartialEq)]
pub enum CachedValue {
    Json(Value),
    Bytes(Vec<u8>),
}

impl CachedValue {
    /// 估算内存占用（字节），用于预算核算
    fn estimated_size(&self) -> usize {
        match self {
            CachedValue::Bytes(b) => b.len(),
            CachedValue::Json(Value::String(s)) => s.len(),
            CachedValue::Json(other) => other.to_string().len(),
        }
    }
}

/// 缓存条目及其元数据
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: CachedValue,
    pub timestamp: DateTime<Utc>,
    pub ttl: Option<u64>,
    pub hit_count: u64,
    pub size_bytes: usize,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        match self.ttl {
            Some(ttl) => Utc::now() > self.timestamp + chrono::Duration::seconds(ttl as i64),
            None => false,
        }
    }
}

/// stats() 的快照
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_size_bytes: usize,
    pub total_hits: u64,
    pub avg_hit_count: f64,
}

struct Inner {
    map: LruMap<String, CacheEntry>,
    total_size: usize,
}

/// 条目数 + 字节数双预算的 LRU 缓存
pub struct EvictingCache {
    max_entries: usize,
    max_memory_bytes: usize,
    inner: Mutex<Inner>,
}

impl EvictingCache {
    pub fn new(max_entries: usize, max_memory_mb: usize) -> Self {
        Self {
            max_entries,
            max_memory_bytes: max_memory_mb * 1024 * 1024,
            // 容量控制由双预算淘汰自行处理，底层 map 不设上限
            inner: Mutex::new(Inner {
                map: LruMap::unbounded(),
                total_size: 0,
            }),
        }
    }

    pub fn from_config(config: &CacheSection) -> Self {
        Self::new(config.max_entries, config.max_memory_mb)
    }

    /// 读取；命中提升为最近使用并累加 hit_count，过期条目删除并视为未命中
    pub async fn get(&self, key: &str) -> Option<CachedValue> {
        let mut inner = self.inner.lock().await;

        let expired = matches!(inner.map.peek(key), Some(e) if e.is_expired());
        if expired {
            if let Some(entry) = inner.map.pop(key) {
                inner.total_size -= entry.size_bytes;
            }
            return None;
        }

        let entry = inner.map.get_mut(key)?;
        entry.hit_count += 1;
        Some(entry.value.clone())
    }

    /// 写入；随后按需淘汰直到两个预算都满足
    pub async fn set(&self, key: impl Into<String>, value: CachedValue, ttl: Option<u64>) {
        let key = key.into();
        let size_bytes = value.estimated_size();
        let mut inner = self.inner.lock().await;

        if let Some(old) = inner.map.pop(&key) {
            inner.total_size -= old.size_bytes;
        }
        inner.total_size += size_bytes;
        inner.map.put(
            key,
            CacheEntry {
                value,
                timestamp: Utc::now(),
                ttl,
                hit_count: 0,
                size_bytes,
            },
        );

        while inner.map.len() > self.max_entries || inner.total_size > self.max_memory_bytes {
            match inner.map.pop_lru() {
                Some((evicted_key, entry)) => {
                    inner.total_size -= entry.size_bytes;
                    tracing::debug!("Evicted cache entry: {}", evicted_key);
                }
                None => break,
            }
        }
    }

    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.map.clear();
        inner.total_size = 0;
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.inner.lock().await.map.peek(key).is_some()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.map.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().await;
        let total_hits: u64 = inner.map.iter().map(|(_, e)| e.hit_count).sum();
        let entries = inner.map.len();
        CacheStats {
            entries,
            total_size_bytes: inner.total_size,
            total_hits,
            avg_hit_count: if entries > 0 {
                total_hits as f64 / entries as f64
            } else {
                0.0
            },
        }
    }
}
