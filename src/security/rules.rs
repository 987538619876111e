//! 安全规则模型与导入导出
//!
//! 规则注册后不可变；注册表可在运行时增删。规则集可导出为带版本号的
//! JSON 用于备份 / 共享。

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::action::ActionType;

/// 规则类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleType {
    /// 值匹配模式即拒绝
    Blacklist,
    /// 值不匹配模式即拒绝
    Whitelist,
    /// 值或任一元数据匹配模式即拒绝（敏感数据）
    Pattern,
    /// 数值 / 域名条件检查
    Permission,
}

/// 规则严重级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// 单条安全规则
///
/// actions 为空表示适用于所有动作类型；pattern 为正则（匹配时忽略大小写）。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityRule {
    pub id: String,
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    pub level: SecurityLevel,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub actions: Vec<ActionType>,
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub conditions: HashMap<String, Value>,
    #[serde(default)]
    pub message: String,
}

impl SecurityRule {
    /// 规则是否适用于该动作类型
    pub fn applies_to(&self, kind: ActionType) -> bool {
        self.actions.is_empty() || self.actions.contains(&kind)
    }
}

/// 带版本号的规则集导出格式
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSetExport {
    pub version: String,
    pub exported_at: DateTime<Utc>,
    pub rules: Vec<SecurityRule>,
}

impl RuleSetExport {
    pub fn new(rules: Vec<SecurityRule>) -> Self {
        Self {
            version: "1.0".to_string(),
            exported_at: Utc::now(),
            rules,
        }
    }
}
