//! KV 存储抽象
//!
//! 所有后端提供 get/set/delete/exists/keys（glob 模式），条目带可选 TTL，
//! 读取时惰性删除过期项。持久化格式统一为 JSON 信封 {value, timestamp, ttl}。

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 持久化信封：值 + 写入时间 + 可选 TTL（秒）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEnvelope {
    pub value: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
}

impl StoredEnvelope {
    pub fn new(value: Value, ttl: Option<u64>) -> Self {
        Self {
            value,
            timestamp: Utc::now(),
            ttl,
        }
    }

    /// TTL 已过期则为 true；无 TTL 永不过期
    pub fn is_expired(&self) -> bool {
        match self.ttl {
            Some(ttl) => Utc::now() - self.timestamp > Duration::seconds(ttl as i64),
            None => false,
        }
    }
}

/// 可插拔的 KV 存储后端（文件 / 内存；网络化共享缓存为可选扩展点）
#[async_trait]
pub trait StateStore: Send + Sync {
    /// 读取；不存在、已过期或损坏都返回 None（损坏会记日志）
    async fn get(&self, key: &str) -> Option<Value>;

    /// 写入，可选 TTL（秒）
    async fn set(&self, key: &str, value: Value, ttl: Option<u64>) -> anyhow::Result<()>;

    async fn delete(&self, key: &str) -> anyhow::Result<()>;

    async fn exists(&self, key: &str) -> bool;

    /// 按 glob 模式列出键（如 "history/*"）
    async fn keys(&self, pattern: &str) -> Vec<String>;
}

/// glob 模式匹配；模式非法时退化为不匹配
pub(crate) fn key_matches(pattern: &str, key: &str) -> bool {
    match glob::Pattern::new(pattern) {
        Ok(p) => p.matches(key),
        Err(e) => {
            tracing::warn!("Invalid key pattern '{}': {}", pattern, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_no_ttl_never_expires() {
        let env = StoredEnvelope::new(serde_json::json!(1), None);
        assert!(!env.is_expired());
    }

    #[test]
    fn test_envelope_expiry() {
        let mut env = StoredEnvelope::new(serde_json::json!(1), Some(10));
        assert!(!env.is_expired());
        env.timestamp = Utc::now() - Duration::seconds(11);
        assert!(env.is_expired());
    }

    #[test]
    fn test_key_matches() {
        assert!(key_matches("history/*", "history/20240101_120000"));
        assert!(key_matches("*", "anything"));
        assert!(!key_matches("patterns/*", "history/x"));
    }
}
