//! 状态管理器：检查点、事务与持久化记录
//!
//! 建立在 StateStore 之上。检查点是全量快照，恢复是整体替换而非合并；
//! 事务同一时刻最多一个，写入先排队、提交时按序应用。

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::StateSection;
use crate::core::action::{Action, OperationResult};
use crate::state::store::StateStore;
use crate::state::{FileStateStore, MemoryStateStore};

/// 检查点等内部记录使用的保留键前缀
const SNAPSHOT_PREFIX: &str = "_snapshots/";

/// 状态层错误
#[derive(Error, Debug)]
pub enum StateError {
    #[error("Transaction already in progress")]
    TransactionInProgress,

    #[error("Invalid transaction {0}")]
    InvalidTransaction(String),

    #[error("Checkpoint {0} not found")]
    CheckpointNotFound(String),

    #[error("Unknown state backend: {0}")]
    UnknownBackend(String),

    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

/// 某一时刻的全量键空间快照；创建后不可变
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub data: HashMap<String, Value>,
    pub metadata: HashMap<String, Value>,
}

/// 事务中排队的单个写操作
#[derive(Debug, Clone)]
pub enum TxOp {
    Set { key: String, value: Value },
    Delete { key: String },
}

/// 进行中的事务；只存在于 begin 与 commit/rollback 之间
#[derive(Debug)]
pub struct StateTransaction {
    pub id: String,
    pub operations: Vec<TxOp>,
    pub timestamp: DateTime<Utc>,
    pub committed: bool,
}

/// 状态层指标
#[derive(Debug, Clone, Serialize)]
pub struct StateMetrics {
    pub total_keys: usize,
    pub checkpoint_count: usize,
    pub pattern_count: usize,
    pub history_entries: usize,
    pub active_transaction: bool,
    pub backend: String,
}

/// 状态管理器
pub struct StateManager {
    store: Arc<dyn StateStore>,
    backend_name: String,
    /// save_state 的默认 TTL；历史 / 模式 / 快照等持久记录不受其影响
    default_ttl: Option<u64>,
    /// 内存中的快照缓存，加速恢复
    snapshots: Mutex<HashMap<String, StateSnapshot>>,
    /// 同一时刻最多一个打开的事务
    current_transaction: Mutex<Option<StateTransaction>>,
}

impl StateManager {
    pub fn new(store: Arc<dyn StateStore>, backend_name: impl Into<String>, default_ttl: Option<u64>) -> Self {
        Self {
            store,
            backend_name: backend_name.into(),
            default_ttl,
            snapshots: Mutex::new(HashMap::new()),
            current_transaction: Mutex::new(None),
        }
    }

    /// 根据 [state] 配置段构建（file / memory）
    pub fn from_config(section: &StateSection) -> Result<Self, StateError> {
        let default_ttl = (section.ttl_secs > 0).then_some(section.ttl_secs);
        let store: Arc<dyn StateStore> = match section.backend.as_str() {
            "file" => Arc::new(FileStateStore::new(&section.path).map_err(StateError::Storage)?),
            "memory" => Arc::new(MemoryStateStore::new()),
            other => return Err(StateError::UnknownBackend(other.to_string())),
        };
        Ok(Self::new(store, section.backend.clone(), default_ttl))
    }

    /// 写入状态；有事务打开时仅排队，不落盘
    pub async fn save_state(&self, key: &str, value: Value) -> Result<(), StateError> {
        let mut tx = self.current_transaction.lock().await;
        if let Some(tx) = tx.as_mut() {
            tx.operations.push(TxOp::Set {
                key: key.to_string(),
                value,
            });
            return Ok(());
        }
        drop(tx);
        self.store.set(key, value, self.default_ttl).await?;
        Ok(())
    }

    pub async fn load_state(&self, key: &str) -> Option<Value> {
        self.store.get(key).await
    }

    /// 删除状态；有事务打开时仅排队
    pub async fn delete_state(&self, key: &str) -> Result<(), StateError> {
        let mut tx = self.current_transaction.lock().await;
        if let Some(tx) = tx.as_mut() {
            tx.operations.push(TxOp::Delete {
                key: key.to_string(),
            });
            return Ok(());
        }
        drop(tx);
        self.store.delete(key).await?;
        Ok(())
    }

    /// 创建检查点：捕获全部非保留键，持久化并缓存在内存
    pub async fn create_checkpoint(&self) -> Result<String, StateError> {
        let checkpoint_id = uuid::Uuid::new_v4().to_string();

        let mut data = HashMap::new();
        for key in self.store.keys("*").await {
            if key.starts_with(SNAPSHOT_PREFIX) {
                continue;
            }
            if let Some(value) = self.store.get(&key).await {
                data.insert(key, value);
            }
        }

        let mut metadata = HashMap::new();
        metadata.insert("key_count".to_string(), Value::from(data.len()));

        let snapshot = StateSnapshot {
            id: checkpoint_id.clone(),
            timestamp: Utc::now(),
            data,
            metadata,
        };

        self.store
            .set(
                &format!("{SNAPSHOT_PREFIX}{checkpoint_id}"),
                serde_json::to_value(&snapshot).map_err(|e| StateError::Storage(e.into()))?,
                None,
            )
            .await?;

        tracing::info!(
            "Created checkpoint {} with {} keys",
            checkpoint_id,
            snapshot.data.len()
        );
        self.snapshots
            .lock()
            .await
            .insert(checkpoint_id.clone(), snapshot);
        Ok(checkpoint_id)
    }

    /// 恢复检查点：整体替换——先删光非保留键，再重写快照中的键
    pub async fn restore_checkpoint(&self, checkpoint_id: &str) -> Result<(), StateError> {
        let snapshot = match self.snapshots.lock().await.get(checkpoint_id) {
            Some(snapshot) => snapshot.clone(),
            None => {
                let value = self
                    .store
                    .get(&format!("{SNAPSHOT_PREFIX}{checkpoint_id}"))
                    .await
                    .ok_or_else(|| StateError::CheckpointNotFound(checkpoint_id.to_string()))?;
                serde_json::from_value(value)
                    .map_err(|_| StateError::CheckpointNotFound(checkpoint_id.to_string()))?
            }
        };

        for key in self.store.keys("*").await {
            if !key.starts_with(SNAPSHOT_PREFIX) {
                self.store.delete(&key).await?;
            }
        }

        for (key, value) in &snapshot.data {
            self.store.set(key, value.clone(), None).await?;
        }

        tracing::info!(
            "Restored checkpoint {} with {} keys",
            checkpoint_id,
            snapshot.data.len()
        );
        Ok(())
    }

    /// 开启事务；已有打开的事务时报错（不可重入）
    pub async fn begin_transaction(&self) -> Result<String, StateError> {
        let mut current = self.current_transaction.lock().await;
        if current.is_some() {
            return Err(StateError::TransactionInProgress);
        }
        let transaction_id = uuid::Uuid::new_v4().to_string();
        *current = Some(StateTransaction {
            id: transaction_id.clone(),
            operations: Vec::new(),
            timestamp: Utc::now(),
            committed: false,
        });
        tracing::info!("Started transaction {}", transaction_id);
        Ok(transaction_id)
    }

    /// 提交事务：按排队顺序应用全部写操作
    pub async fn commit_transaction(&self, transaction_id: &str) -> Result<(), StateError> {
        let mut current = self.current_transaction.lock().await;
        let tx = match current.take() {
            Some(tx) if tx.id == transaction_id => tx,
            other => {
                *current = other;
                return Err(StateError::InvalidTransaction(transaction_id.to_string()));
            }
        };
        drop(current);

        for op in tx.operations {
            match op {
                TxOp::Set { key, value } => {
                    self.store.set(&key, value, self.default_ttl).await?;
                }
                TxOp::Delete { key } => {
                    self.store.delete(&key).await?;
                }
            }
        }
        tracing::info!("Committed transaction {}", transaction_id);
        Ok(())
    }

    /// 回滚事务：丢弃全部排队写操作
    pub async fn rollback_transaction(&self, transaction_id: &str) -> Result<(), StateError> {
        let mut current = self.current_transaction.lock().await;
        match current.take() {
            Some(tx) if tx.id == transaction_id => {
                tracing::info!("Rolled back transaction {}", transaction_id);
                Ok(())
            }
            other => {
                *current = other;
                Err(StateError::InvalidTransaction(transaction_id.to_string()))
            }
        }
    }

    /// 保存命名动作序列，供重放
    pub async fn save_pattern(&self, name: &str, actions: &[Action]) -> Result<(), StateError> {
        let value = serde_json::to_value(actions).map_err(|e| StateError::Storage(e.into()))?;
        self.store
            .set(&format!("patterns/{name}"), value, None)
            .await?;
        Ok(())
    }

    pub async fn load_pattern(&self, name: &str) -> Option<Vec<Action>> {
        let value = self.store.get(&format!("patterns/{name}")).await?;
        match serde_json::from_value(value) {
            Ok(actions) => Some(actions),
            Err(e) => {
                tracing::warn!("Corrupt pattern '{}': {}", name, e);
                None
            }
        }
    }

    /// 追加操作历史，键为时间戳（秒级）
    pub async fn save_operation_history(
        &self,
        results: &[OperationResult],
    ) -> Result<(), StateError> {
        let key = format!("history/{}", Utc::now().format("%Y%m%d_%H%M%S"));
        let value = serde_json::to_value(results).map_err(|e| StateError::Storage(e.into()))?;
        self.store.set(&key, value, None).await?;
        Ok(())
    }

    /// 最近的操作历史，最新在前，最多 limit 条
    pub async fn get_operation_history(&self, limit: usize) -> Vec<OperationResult> {
        let mut keys = self.store.keys("history/*").await;
        keys.sort_by(|a, b| b.cmp(a));

        let mut all = Vec::new();
        for key in keys {
            if all.len() >= limit {
                break;
            }
            let Some(value) = self.store.get(&key).await else {
                continue;
            };
            match serde_json::from_value::<Vec<OperationResult>>(value) {
                Ok(results) => all.extend(results),
                Err(e) => tracing::warn!("Corrupt history entry {}: {}", key, e),
            }
        }
        all.truncate(limit);
        all
    }

    /// 清理早于 cutoff 的历史与快照，返回删除条数
    pub async fn cleanup_old_data(&self, days: i64) -> Result<usize, StateError> {
        let cutoff = Utc::now() - Duration::days(days);
        let mut deleted = 0usize;

        for key in self.store.keys("history/*").await {
            let Some(stamp) = key.strip_prefix("history/") else {
                continue;
            };
            let Some(date_part) = stamp.split('_').next() else {
                continue;
            };
            if let Ok(date) = chrono::NaiveDate::parse_from_str(date_part, "%Y%m%d") {
                if date < cutoff.date_naive() {
                    self.store.delete(&key).await?;
                    deleted += 1;
                }
            }
        }

        for key in self.store.keys("_snapshots/*").await {
            let Some(value) = self.store.get(&key).await else {
                continue;
            };
            let timestamp = value
                .get("timestamp")
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<DateTime<Utc>>().ok());
            if let Some(ts) = timestamp {
                if ts < cutoff {
                    self.store.delete(&key).await?;
                    self.snapshots
                        .lock()
                        .await
                        .remove(key.trim_start_matches(SNAPSHOT_PREFIX));
                    deleted += 1;
                }
            }
        }

        tracing::info!("Cleaned up {} old entries", deleted);
        Ok(deleted)
    }

    /// 键空间指标
    pub async fn metrics(&self) -> StateMetrics {
        let keys = self.store.keys("*").await;
        StateMetrics {
            total_keys: keys.len(),
            checkpoint_count: keys.iter().filter(|k| k.starts_with(SNAPSHOT_PREFIX)).count(),
            pattern_count: keys.iter().filter(|k| k.starts_with("patterns/")).count(),
            history_entries: keys.iter().filter(|k| k.starts_with("history/")).count(),
            active_transaction: self.current_transaction.lock().await.is_some(),
            backend: self.backend_name.clone(),
        }
    }

    /// 底层存储（供直接读写，不经过事务队列）
    pub fn store(&self) -> Arc<dyn StateStore> {
        self.store.clone()
    }
}
