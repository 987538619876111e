//! Action 模型与外部执行接口
//!
//! Action 描述「做什么」（点击、输入、执行命令等），创建后不可变；
//! 真正的执行由外部注入的 ActionExecutor 完成，本 crate 不关心其内部实现。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 动作类型（闭合枚举，不做运行时注册表）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Click,
    Type,
    Key,
    Screenshot,
    Wait,
    Scroll,
    Drag,
    Hover,
    /// 系统命令执行（特权动作）
    Execute,
    /// 外部仓库写操作（特权动作）
    Github,
}

impl ActionType {
    /// 沙箱模式下禁止的特权动作
    pub fn is_privileged(&self) -> bool {
        matches!(self, ActionType::Execute | ActionType::Github)
    }

    /// 必须串行执行的动作（键入 / 命令执行），不参与并行化建议
    pub fn is_strictly_sequential(&self) -> bool {
        matches!(self, ActionType::Type | ActionType::Execute)
    }
}

/// 屏幕坐标
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coordinate {
    pub x: i32,
    pub y: i32,
}

impl Coordinate {
    /// 从百分比坐标换算为像素坐标
    pub fn from_percentage(
        x_percent: f64,
        y_percent: f64,
        screen_width: i32,
        screen_height: i32,
    ) -> Self {
        Self {
            x: (x_percent * screen_width as f64 / 100.0) as i32,
            y: (y_percent * screen_height as f64 / 100.0) as i32,
        }
    }
}

/// 动作目标：坐标或命名元素（窗口名、仓库名等）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActionTarget {
    Coordinate(Coordinate),
    Named(String),
}

impl std::fmt::Display for ActionTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionTarget::Coordinate(c) => write!(f, "({},{})", c.x, c.y),
            ActionTarget::Named(name) => write!(f, "{name}"),
        }
    }
}

/// 一条原子指令：id + 类型 + 目标 + 值 + 扩展元数据
///
/// 已知字段全部为类型化结构，动态数据只允许放进 metadata 这一个显式扩展表。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ActionType,
    #[serde(default)]
    pub target: Option<ActionTarget>,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl Action {
    pub fn new(kind: ActionType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            target: None,
            value: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_target(mut self, target: ActionTarget) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_value(mut self, value: impl Into<Value>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// 操作的生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// 已创建，等待调度
    Pending,
    /// 正在执行
    Running,
    /// 成功
    Success,
    /// 失败（含重试耗尽）
    Failed,
    /// 已取消（协作式，不抢占在途工作）
    Cancelled,
    /// 重试耗尽后回滚成功
    RolledBack,
}

impl OperationStatus {
    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OperationStatus::Pending | OperationStatus::Running)
    }
}

/// 单次操作的执行结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResult {
    pub operation_id: String,
    pub status: OperationStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// 执行耗时（秒）
    #[serde(default)]
    pub duration: Option<f64>,
}

impl OperationResult {
    pub fn success(operation_id: impl Into<String>, result: Option<Value>) -> Self {
        Self {
            operation_id: operation_id.into(),
            status: OperationStatus::Success,
            result,
            error: None,
            timestamp: Utc::now(),
            duration: None,
        }
    }

    pub fn failure(operation_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            operation_id: operation_id.into(),
            status: OperationStatus::Failed,
            result: None,
            error: Some(error.into()),
            timestamp: Utc::now(),
            duration: None,
        }
    }

    pub fn with_status(mut self, status: OperationStatus) -> Self {
        self.status = status;
        self
    }
}

/// 外部动作执行器：屏幕自动化 / GitHub API / 模型调用等由实现方提供
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// 执行单个动作
    async fn execute_action(&self, action: &Action) -> Result<OperationResult, String>;

    /// 执行前的轻量可行性检查（与安全校验无关）
    async fn validate_action(&self, action: &Action) -> bool {
        let _ = action;
        true
    }

    /// 实现方支持的动作类型
    fn supported_action_types(&self) -> Vec<ActionType>;
}

/// 模型顾问：根据观测与目标提出下一个动作（仅作为操作来源，可选）
#[async_trait]
pub trait ModelAdvisor: Send + Sync {
    async fn propose_next_action(
        &self,
        observation: &[u8],
        objective: &str,
    ) -> Result<Action, String>;
}
