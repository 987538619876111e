//! 性能优化器：用内容哈希记忆化昂贵的外部调用
//!
//! 模型建议按 (观测哈希, 目标哈希) 记忆化，截图按固定键短 TTL 缓存。
//! 底层屏幕状态随时可能变化，这些派生结果只适合秒级到分钟级的 TTL。

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::cache::lru::{CachedValue, EvictingCache};
use crate::config::CacheSection;
use crate::core::action::{Action, ModelAdvisor};

/// 聚合性能指标
#[derive(Debug, Clone, Default, Serialize)]
pub struct PerformanceMetrics {
    pub operation_count: u64,
    pub total_duration: f64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub parallel_executions: u64,
    pub failed_operations: u64,
}

impl PerformanceMetrics {
    pub fn average_duration(&self) -> f64 {
        if self.operation_count > 0 {
            self.total_duration / self.operation_count as f64
        } else {
            0.0
        }
    }

    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total > 0 {
            self.cache_hits as f64 / total as f64
        } else {
            0.0
        }
    }
}

/// 性能优化协调器
pub struct PerformanceOptimizer {
    cache: Arc<EvictingCache>,
    model_response_ttl: u64,
    screenshot_ttl: u64,
    metrics: Mutex<PerformanceMetrics>,
    last_screen_hash: Mutex<Option<String>>,
}

impl PerformanceOptimizer {
    pub fn new(config: &CacheSection) -> Self {
        Self {
            cache: Arc::new(EvictingCache::from_config(config)),
            model_response_ttl: config.model_response_ttl_secs,
            screenshot_ttl: config.screenshot_ttl_secs,
            metrics: Mutex::new(PerformanceMetrics::default()),
            last_screen_hash: Mutex::new(None),
        }
    }

    /// 共享底层缓存（编排器的缓存建议也用它）
    pub fn cache(&self) -> Arc<EvictingCache> {
        Arc::clone(&self.cache)
    }

    /// 带记忆化的模型建议：相同 (观测, 目标) 在 TTL 内直接复用缓存结果
    ///
    /// 缓存条目损坏（反序列化失败）按未命中处理并覆盖重写。
    pub async fn propose_action_cached(
        &self,
        observation: &[u8],
        objective: &str,
        advisor: &dyn ModelAdvisor,
    ) -> Result<Action, String> {
        let started = Instant::now();
        let cache_key = format!(
            "model_response_{}_{}",
            content_hash(observation),
            content_hash(objective.as_bytes())
        );

        if let Some(CachedValue::Json(value)) = self.cache.get(&cache_key).await {
            match serde_json::from_value::<Action>(value) {
                Ok(action) => {
                    let mut metrics = self.metrics.lock().await;
                    metrics.cache_hits += 1;
                    metrics.operation_count += 1;
                    metrics.total_duration += started.elapsed().as_secs_f64();
                    tracing::debug!("Using cached model response for objective hash");
                    return Ok(action);
                }
                Err(e) => {
                    tracing::warn!("Discarding corrupt cached model response: {}", e);
                }
            }
        }

        let result = advisor.propose_next_action(observation, objective).await;

        let mut metrics = self.metrics.lock().await;
        metrics.cache_misses += 1;
        metrics.operation_count += 1;
        metrics.total_duration += started.elapsed().as_secs_f64();
        if result.is_err() {
            metrics.failed_operations += 1;
        }
        drop(metrics);

        let action = result?;
        match serde_json::to_value(&action) {
            Ok(value) => {
                self.cache
                    .set(cache_key, CachedValue::Json(value), Some(self.model_response_ttl))
                    .await;
            }
            Err(e) => tracing::warn!("Failed to serialize model response for cache: {}", e),
        }
        Ok(action)
    }

    /// 带短 TTL 缓存的屏幕捕获：TTL 内重复请求不触发真实捕获
    pub async fn capture_cached<F, Fut>(&self, capture: F) -> Result<Vec<u8>, String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>, String>>,
    {
        const KEY: &str = "screenshot_current";

        if let Some(CachedValue::Bytes(bytes)) = self.cache.get(KEY).await {
            self.metrics.lock().await.cache_hits += 1;
            return Ok(bytes);
        }

        let screenshot = capture().await?;
        self.metrics.lock().await.cache_misses += 1;
        self.cache
            .set(KEY, CachedValue::Bytes(screenshot.clone()), Some(self.screenshot_ttl))
            .await;
        Ok(screenshot)
    }

    /// 屏幕是否相对上次观测发生变化（按内容哈希比较）
    pub async fn screen_changed(&self, screenshot: &[u8]) -> bool {
        let current = content_hash(screenshot);
        let mut last = self.last_screen_hash.lock().await;
        if last.as_deref() == Some(current.as_str()) {
            return false;
        }
        *last = Some(current);
        true
    }

    pub async fn record_parallel_execution(&self, count: usize) {
        self.metrics.lock().await.parallel_executions += count as u64;
    }

    pub async fn metrics(&self) -> PerformanceMetrics {
        self.metrics.lock().await.clone()
    }
}

/// 内容哈希（SHA-256 十六进制前 16 位），用作缓存键片段
fn content_hash(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut hex = String::with_capacity(16);
    for byte in &digest[..8] {
        hex.push_str(&format!("{:02x}", byte));
    }
    hex
}
