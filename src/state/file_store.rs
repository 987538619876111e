//! 文件后端：每个键一个 JSON 文件
//!
//! 键中的 '/' 映射为子目录，内容为 {value, timestamp, ttl} 信封。
//! 每键一把锁串行化读写；TTL 在读取时惰性删除。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use walkdir::WalkDir;

use crate::state::store::{key_matches, StateStore, StoredEnvelope};

/// 文件 KV 存储；base_path 不存在时自动创建
pub struct FileStateStore {
    base_path: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FileStateStore {
    pub fn new(base_path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_path)?;
        Ok(Self {
            base_path,
            locks: Mutex::new(HashMap::new()),
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let mut path = self.base_path.clone();
        for part in key.split('/') {
            path.push(part);
        }
        path.set_extension("json");
        path
    }

    async fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn get(&self, key: &str) -> Option<Value> {
        let path = self.path_for(key);
        if !path.exists() {
            return None;
        }

        let lock = self.lock_for(key).await;
        let _guard = lock.lock().await;

        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!("Error reading state {}: {}", key, e);
                return None;
            }
        };

        let envelope: StoredEnvelope = match serde_json::from_str(&data) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("Corrupt state entry {}: {}", key, e);
                return None;
            }
        };

        if envelope.is_expired() {
            let _ = tokio::fs::remove_file(&path).await;
            return None;
        }

        Some(envelope.value)
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<u64>) -> anyhow::Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let lock = self.lock_for(key).await;
        let _guard = lock.lock().await;

        let envelope = StoredEnvelope::new(value, ttl);
        tokio::fs::write(&path, serde_json::to_string(&envelope)?).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        let path = self.path_for(key);
        let lock = self.lock_for(key).await;
        let _guard = lock.lock().await;
        if path.exists() {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> bool {
        self.path_for(key).exists()
    }

    async fn keys(&self, pattern: &str) -> Vec<String> {
        let mut keys = Vec::new();
        for entry in WalkDir::new(&self.base_path)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(relative) = path.strip_prefix(&self.base_path) else {
                continue;
            };
            let key = relative
                .with_extension("")
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            if key_matches(pattern, &key) {
                keys.push(key);
            }
        }
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path()).unwrap();

        store.set("alpha", json!({"n": 1}), None).await.unwrap();
        assert_eq!(store.get("alpha").await, Some(json!({"n": 1})));
        assert!(store.exists("alpha").await);

        store.delete("alpha").await.unwrap();
        assert_eq!(store.get("alpha").await, None);
        assert!(!store.exists("alpha").await);
    }

    #[tokio::test]
    async fn test_nested_keys_and_patterns() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path()).unwrap();

        store.set("patterns/login", json!([1]), None).await.unwrap();
        store
            .set("history/20240101_010101", json!([2]), None)
            .await
            .unwrap();

        let mut all = store.keys("*").await;
        all.sort();
        assert_eq!(all, vec!["history/20240101_010101", "patterns/login"]);

        let history = store.keys("history/*").await;
        assert_eq!(history, vec!["history/20240101_010101"]);
    }

    #[tokio::test]
    async fn test_ttl_lazy_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path()).unwrap();

        // 手写一个已过期的信封
        let mut envelope = StoredEnvelope::new(json!("stale"), Some(1));
        envelope.timestamp = chrono::Utc::now() - chrono::Duration::seconds(5);
        let path = dir.path().join("stale.json");
        std::fs::write(&path, serde_json::to_string(&envelope).unwrap()).unwrap();

        assert_eq!(store.get("stale").await, None);
        assert!(!path.exists(), "expired entry should be deleted on read");
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_miss() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path()).unwrap();
        std::fs::write(dir.path().join("bad.json"), "not json at all").unwrap();
        assert_eq!(store.get("bad").await, None);
    }
}
