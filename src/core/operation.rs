//! Operation 模型：Action + 编排元数据
//!
//! Operation 由调用方构建，编排器只改 retry_count；校验与回滚钩子是构造期
//! 注入的异步闭包（闭合分发），不做运行时注册表。终态结果返回后即销毁，
//! 除非显式写入历史。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::core::action::{Action, OperationResult};

/// 前置校验钩子：返回 false 表示校验失败（终态，不重试）
pub type PreValidation = Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;

/// 后置校验钩子：对执行结果做断言
pub type PostValidation = Arc<dyn Fn(OperationResult) -> BoxFuture<'static, bool> + Send + Sync>;

/// 回滚钩子：重试耗尽后调用，之后编排器恢复检查点
pub type RollbackHook = Arc<dyn Fn() -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

/// 一个待编排的工作单元
pub struct Operation {
    /// 批次内唯一
    pub id: String,
    pub action: Action,
    pub pre_validation: Option<PreValidation>,
    pub post_validation: Option<PostValidation>,
    pub rollback: Option<RollbackHook>,
    /// 依赖的 Operation id 集合（同批次内）
    pub dependencies: HashSet<String>,
    pub metadata: HashMap<String, Value>,
    /// 仅由编排器递增，单调且 <= max_retries
    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout: Option<Duration>,
}

impl Operation {
    pub fn new(action: Action) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            action,
            pre_validation: None,
            post_validation: None,
            rollback: None,
            dependencies: HashSet::new(),
            metadata: HashMap::new(),
            retry_count: 0,
            max_retries: 3,
            timeout: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn depends_on(mut self, operation_id: impl Into<String>) -> Self {
        self.dependencies.insert(operation_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_pre_validation(mut self, hook: PreValidation) -> Self {
        self.pre_validation = Some(hook);
        self
    }

    pub fn with_post_validation(mut self, hook: PostValidation) -> Self {
        self.post_validation = Some(hook);
        self
    }

    pub fn with_rollback(mut self, hook: RollbackHook) -> Self {
        self.rollback = Some(hook);
        self
    }

    /// metadata 中的 continue_on_failure 标志（execute_sequence 用）
    pub fn continue_on_failure(&self) -> bool {
        self.metadata
            .get("continue_on_failure")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id)
            .field("action", &self.action.kind)
            .field("dependencies", &self.dependencies)
            .field("retry_count", &self.retry_count)
            .field("max_retries", &self.max_retries)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// 单次执行尝试的上下文；重试时以前一次为 parent，形成一棵尝试树
#[derive(Debug)]
pub struct ExecutionContext {
    pub operation_id: String,
    pub start_time: DateTime<Utc>,
    /// 执行前创建的检查点 id（仅当操作带回滚钩子）
    checkpoint_id: Mutex<Option<String>>,
    pub parent: Option<Arc<ExecutionContext>>,
    children: Mutex<Vec<Arc<ExecutionContext>>>,
}

impl ExecutionContext {
    pub fn new(operation_id: impl Into<String>, parent: Option<Arc<ExecutionContext>>) -> Arc<Self> {
        let context = Arc::new(Self {
            operation_id: operation_id.into(),
            start_time: Utc::now(),
            checkpoint_id: Mutex::new(None),
            parent: parent.clone(),
            children: Mutex::new(Vec::new()),
        });
        if let Some(parent) = parent {
            parent.children.lock().unwrap().push(context.clone());
        }
        context
    }

    pub fn set_checkpoint(&self, checkpoint_id: String) {
        *self.checkpoint_id.lock().unwrap() = Some(checkpoint_id);
    }

    pub fn checkpoint_id(&self) -> Option<String> {
        self.checkpoint_id.lock().unwrap().clone()
    }

    /// 尝试树深度（根为 0），即当前是第几次重试
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut current = self.parent.clone();
        while let Some(ctx) = current {
            depth += 1;
            current = ctx.parent.clone();
        }
        depth
    }
}
