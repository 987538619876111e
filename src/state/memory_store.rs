//! 内存后端：进程内易失 KV 存储
//!
//! 与文件后端同语义（TTL 惰性删除、glob 键匹配），用于测试与纯内存场景。

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::state::store::{key_matches, StateStore, StoredEnvelope};

#[derive(Default)]
pub struct MemoryStateStore {
    data: Mutex<HashMap<String, StoredEnvelope>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> Option<Value> {
        let mut data = self.data.lock().await;
        match data.get(key) {
            Some(envelope) if envelope.is_expired() => {
                data.remove(key);
                None
            }
            Some(envelope) => Some(envelope.value.clone()),
            None => None,
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<u64>) -> anyhow::Result<()> {
        self.data
            .lock()
            .await
            .insert(key.to_string(), StoredEnvelope::new(value, ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.data.lock().await.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> bool {
        self.data.lock().await.contains_key(key)
    }

    async fn keys(&self, pattern: &str) -> Vec<String> {
        self.data
            .lock()
            .await
            .keys()
            .filter(|k| key_matches(pattern, k))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_round_trip() {
        let store = MemoryStateStore::new();
        store.set("k", json!(42), None).await.unwrap();
        assert_eq!(store.get("k").await, Some(json!(42)));
        store.delete("k").await.unwrap();
        assert!(!store.exists("k").await);
    }

    #[tokio::test]
    async fn test_ttl_expiry_is_lazy() {
        let store = MemoryStateStore::new();
        store.set("k", json!(1), Some(1)).await.unwrap();
        // 手动把时间戳拨回过去，模拟过期
        {
            let mut data = store.data.lock().await;
            let envelope = data.get_mut("k").unwrap();
            envelope.timestamp = chrono::Utc::now() - chrono::Duration::seconds(5);
        }
        assert_eq!(store.get("k").await, None);
        assert!(!store.data.lock().await.contains_key("k"));
    }

    #[tokio::test]
    async fn test_pattern_keys() {
        let store = MemoryStateStore::new();
        store.set("patterns/a", json!(1), None).await.unwrap();
        store.set("history/b", json!(2), None).await.unwrap();
        let keys = store.keys("patterns/*").await;
        assert_eq!(keys, vec!["patterns/a"]);
    }
}
