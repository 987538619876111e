//! 安全守卫
//!
//! 每个操作执行前都要经过 validate_action：沙箱检查 → 按注册顺序过一遍
//! 规则 → 确认类别检查，第一个违规即拒绝。所有校验结果进审计日志，
//! 满 100 条落盘并清空。守卫全程同步（纯 CPU 检查 + 小文件写入），
//! 可直接在异步上下文调用。

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use serde_json::Value;

use crate::config::SecuritySection;
use crate::core::action::{Action, ActionType};
use crate::security::rules::{RuleSetExport, RuleType, SecurityLevel, SecurityRule};

/// 审计日志落盘阈值
const AUDIT_FLUSH_THRESHOLD: usize = 100;

/// 确认决定的缓存时长
const CONFIRMATION_TTL: Duration = Duration::from_secs(5 * 60);

/// 进程级安全状态
#[derive(Debug)]
pub struct SecurityContext {
    pub sandbox_mode: bool,
    pub granted_permissions: HashSet<String>,
    pub session_id: String,
}

/// 单条审计记录
#[derive(Debug, Clone, Serialize)]
struct AuditEntry {
    timestamp: chrono::DateTime<Utc>,
    event: String,
    session_id: String,
    sandbox_mode: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    action: Option<Value>,
}

/// 安全守卫：规则注册表 + 沙箱开关 + 确认缓存 + 审计日志
pub struct SecurityGuardian {
    config: SecuritySection,
    rules: RwLock<Vec<SecurityRule>>,
    /// 规则 id -> 注册时编译好的正则
    compiled: RwLock<HashMap<String, Regex>>,
    context: RwLock<SecurityContext>,
    confirmation_cache: Mutex<HashMap<String, (bool, Instant)>>,
    audit_log: Mutex<Vec<AuditEntry>>,
    audit_dir: PathBuf,
}

impl SecurityGuardian {
    pub fn new(config: SecuritySection) -> Self {
        let guardian = Self {
            context: RwLock::new(SecurityContext {
                sandbox_mode: config.enable_sandbox,
                granted_permissions: HashSet::new(),
                session_id: uuid::Uuid::new_v4().to_string(),
            }),
            config,
            rules: RwLock::new(Vec::new()),
            compiled: RwLock::new(HashMap::new()),
            confirmation_cache: Mutex::new(HashMap::new()),
            audit_log: Mutex::new(Vec::new()),
            audit_dir: PathBuf::from("logs/security"),
        };
        guardian.load_default_rules();
        guardian
    }

    /// 审计日志落盘目录（默认 logs/security）
    pub fn with_audit_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.audit_dir = dir.into();
        self
    }

    /// 从配置构建默认规则：命令黑名单、敏感数据模式、载荷上限、域名允许表
    fn load_default_rules(&self) {
        if !self.config.blacklisted_commands.is_empty() {
            let blacklist_pattern = self
                .config
                .blacklisted_commands
                .iter()
                .map(|c| regex::escape(c))
                .collect::<Vec<_>>()
                .join("|");
            let _ = self.add_rule(SecurityRule {
                id: "sys_cmd_blacklist".into(),
                rule_type: RuleType::Blacklist,
                level: SecurityLevel::Critical,
                pattern: Some(blacklist_pattern),
                actions: vec![ActionType::Execute],
                targets: vec![],
                conditions: HashMap::new(),
                message: "Dangerous system command detected".into(),
            });
        }

        for (i, pattern) in self.config.sensitive_patterns.iter().enumerate() {
            let _ = self.add_rule(SecurityRule {
                id: format!("sensitive_pattern_{i}"),
                rule_type: RuleType::Pattern,
                level: SecurityLevel::High,
                pattern: Some(pattern.clone()),
                actions: vec![],
                targets: vec![],
                conditions: HashMap::new(),
                message: "Potential sensitive data exposure".into(),
            });
        }

        let _ = self.add_rule(SecurityRule {
            id: "file_size_limit".into(),
            rule_type: RuleType::Permission,
            level: SecurityLevel::Medium,
            pattern: None,
            actions: vec![ActionType::Type],
            targets: vec![],
            conditions: HashMap::from([(
                "max_size".to_string(),
                Value::from(self.config.max_file_size),
            )]),
            message: "File size exceeds limit".into(),
        });

        let _ = self.add_rule(SecurityRule {
            id: "domain_allowlist".into(),
            rule_type: RuleType::Permission,
            level: SecurityLevel::Medium,
            pattern: None,
            actions: vec![ActionType::Github],
            targets: vec![],
            conditions: HashMap::from([(
                "allowed_domains".to_string(),
                Value::from(self.config.allowed_domains.clone()),
            )]),
            message: "Domain not allowed".into(),
        });
    }

    /// 注册规则；正则在此一次性编译（忽略大小写）
    pub fn add_rule(&self, rule: SecurityRule) -> anyhow::Result<()> {
        if let Some(pattern) = &rule.pattern {
            let regex = RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|e| anyhow::anyhow!("Invalid rule pattern '{}': {}", pattern, e))?;
            self.compiled
                .write()
                .unwrap()
                .insert(rule.id.clone(), regex);
        }
        tracing::info!("Added security rule: {}", rule.id);
        self.rules.write().unwrap().push(rule);
        Ok(())
    }

    pub fn remove_rule(&self, rule_id: &str) {
        self.rules.write().unwrap().retain(|r| r.id != rule_id);
        self.compiled.write().unwrap().remove(rule_id);
        tracing::info!("Removed security rule: {}", rule_id);
    }

    /// 校验动作；返回 (是否放行, 拒绝原因)
    ///
    /// 顺序：沙箱特权检查 → 规则（注册顺序，第一个违规即返回）→ 确认类别。
    pub fn validate_action(&self, action: &Action) -> (bool, Option<String>) {
        self.audit(Some(action), "validation_started");

        if self.is_sandbox_mode() && action.kind.is_privileged() {
            self.audit(Some(action), "sandbox_blocked");
            return (false, Some("Action not allowed in sandbox mode".into()));
        }

        let rules = self.rules.read().unwrap().clone();
        for rule in &rules {
            if let Some(detail) = self.check_rule(action, rule) {
                self.audit(Some(action), "validation_failed");
                tracing::warn!("Action {} blocked by rule {}", action.id, rule.id);
                return (false, Some(format!("{}: {}", rule.message, detail)));
            }
        }

        if self.requires_confirmation(action) && !self.request_permission(action) {
            self.audit(Some(action), "user_denied");
            return (false, Some("User denied permission".into()));
        }

        self.audit(Some(action), "validation_passed");
        (true, None)
    }

    /// 单条规则检查；返回违规详情，None 表示通过
    fn check_rule(&self, action: &Action, rule: &SecurityRule) -> Option<String> {
        if !rule.applies_to(action.kind) {
            return None;
        }

        let regex = self.compiled.read().unwrap().get(&rule.id).cloned();

        match rule.rule_type {
            RuleType::Blacklist => {
                let (regex, value) = (regex?, action.value.as_ref()?);
                if regex.is_match(&value_as_string(value)) {
                    return Some("Blacklisted pattern matched".into());
                }
            }
            RuleType::Whitelist => {
                let (regex, value) = (regex?, action.value.as_ref()?);
                if !regex.is_match(&value_as_string(value)) {
                    return Some("Value not in whitelist".into());
                }
            }
            RuleType::Pattern => {
                let regex = regex?;
                let mut haystacks = Vec::new();
                if let Some(value) = &action.value {
                    haystacks.push(value_as_string(value));
                }
                haystacks.extend(action.metadata.values().map(value_as_string));
                for text in haystacks {
                    if regex.is_match(&text) {
                        return Some(format!(
                            "Sensitive pattern detected: {}",
                            rule.pattern.as_deref().unwrap_or_default()
                        ));
                    }
                }
            }
            RuleType::Permission => {
                if let (Some(max_size), Some(size)) = (
                    rule.conditions.get("max_size").and_then(Value::as_u64),
                    action.metadata.get("size").and_then(Value::as_u64),
                ) {
                    if size > max_size {
                        return Some("Permission check failed".into());
                    }
                }
                if let (Some(allowed), Some(domain)) = (
                    rule.conditions.get("allowed_domains").and_then(Value::as_array),
                    action.metadata.get("domain").and_then(Value::as_str),
                ) {
                    if !allowed.iter().any(|d| d.as_str() == Some(domain)) {
                        return Some("Permission check failed".into());
                    }
                }
            }
        }
        None
    }

    /// 动作类别是否配置为需要交互确认
    fn requires_confirmation(&self, action: &Action) -> bool {
        let category = categorize_action(action);
        self.config
            .require_confirmation
            .iter()
            .any(|c| c == category)
    }

    /// 请求确认；决定按 (类型, 目标, 值) 缓存 5 分钟
    ///
    /// 核心层没有 UI，默认决定沿用沙箱语义：沙箱关闭视为放行。
    pub fn request_permission(&self, action: &Action) -> bool {
        let cache_key = format!(
            "{:?}:{}:{}",
            action.kind,
            action
                .target
                .as_ref()
                .map(|t| t.to_string())
                .unwrap_or_default(),
            action.value.as_ref().map(value_as_string).unwrap_or_default()
        );

        let mut cache = self.confirmation_cache.lock().unwrap();
        if let Some((decision, at)) = cache.get(&cache_key) {
            if at.elapsed() < CONFIRMATION_TTL {
                return *decision;
            }
        }

        tracing::warn!("Permission requested for action {} ({:?})", action.id, action.kind);
        let decision = !self.is_sandbox_mode();
        cache.insert(cache_key, (decision, Instant::now()));
        decision
    }

    pub fn is_sandbox_mode(&self) -> bool {
        self.context.read().unwrap().sandbox_mode
    }

    pub fn set_sandbox_mode(&self, enabled: bool) {
        self.context.write().unwrap().sandbox_mode = enabled;
    }

    /// 进入作用域沙箱；守卫 drop 时恢复之前的值（任何退出路径都生效）
    pub fn sandbox_scope(&self) -> SandboxGuard<'_> {
        let previous = {
            let mut context = self.context.write().unwrap();
            let previous = context.sandbox_mode;
            context.sandbox_mode = true;
            previous
        };
        tracing::info!("Entering sandbox mode");
        SandboxGuard {
            guardian: self,
            previous,
        }
    }

    pub fn grant_permission(&self, permission: impl Into<String>) {
        self.context
            .write()
            .unwrap()
            .granted_permissions
            .insert(permission.into());
        self.audit(None, "permission_granted");
    }

    pub fn revoke_permission(&self, permission: &str) {
        self.context
            .write()
            .unwrap()
            .granted_permissions
            .remove(permission);
        self.audit(None, "permission_revoked");
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.context
            .read()
            .unwrap()
            .granted_permissions
            .contains(permission)
    }

    /// 导出规则集（带版本号），供备份 / 共享
    pub fn export_rules(&self) -> RuleSetExport {
        RuleSetExport::new(self.rules.read().unwrap().clone())
    }

    /// 导入规则集；逐条注册，正则非法的规则报错
    pub fn import_rules(&self, export: &RuleSetExport) -> anyhow::Result<()> {
        for rule in &export.rules {
            self.add_rule(rule.clone())?;
        }
        Ok(())
    }

    /// 追加审计记录；满阈值落盘并清空
    fn audit(&self, action: Option<&Action>, event: &str) {
        let context = self.context.read().unwrap();
        let entry = AuditEntry {
            timestamp: Utc::now(),
            event: event.to_string(),
            session_id: context.session_id.clone(),
            sandbox_mode: context.sandbox_mode,
            action: action.map(|a| {
                serde_json::json!({
                    "id": a.id,
                    "type": a.kind,
                    "target": a.target.as_ref().map(|t| t.to_string()),
                })
            }),
        };
        drop(context);

        let mut log = self.audit_log.lock().unwrap();
        log.push(entry);
        if log.len() >= AUDIT_FLUSH_THRESHOLD {
            let entries = std::mem::take(&mut *log);
            drop(log);
            self.flush_audit(&entries);
        }
    }

    fn flush_audit(&self, entries: &[AuditEntry]) {
        if let Err(e) = std::fs::create_dir_all(&self.audit_dir) {
            tracing::warn!("Failed to create audit dir: {}", e);
            return;
        }
        let path = self
            .audit_dir
            .join(format!("audit_{}.json", Utc::now().format("%Y%m%d_%H%M%S")));
        match serde_json::to_string_pretty(entries) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&path, json) {
                    tracing::warn!("Failed to persist audit log: {}", e);
                }
            }
            Err(e) => tracing::warn!("Failed to serialize audit log: {}", e),
        }
    }

    /// 当前内存中的审计记录数（未落盘部分）
    pub fn pending_audit_entries(&self) -> usize {
        self.audit_log.lock().unwrap().len()
    }
}

/// 作用域沙箱守卫；drop 时恢复进入前的沙箱开关
pub struct SandboxGuard<'a> {
    guardian: &'a SecurityGuardian,
    previous: bool,
}

impl Drop for SandboxGuard<'_> {
    fn drop(&mut self) {
        self.guardian
            .context
            .write()
            .unwrap()
            .sandbox_mode = self.previous;
        tracing::info!("Exiting sandbox mode");
    }
}

/// 字符串直接取内容，其余类型 JSON 序列化后匹配
fn value_as_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// 确认类别：特权执行 / 破坏性文件操作 / 出站网络请求
fn categorize_action(action: &Action) -> &'static str {
    match action.kind {
        ActionType::Execute => "system_commands",
        ActionType::Type
            if action.metadata.get("file_operation").and_then(Value::as_str) == Some("delete") =>
        {
            "file_deletion"
        }
        ActionType::Github
            if action
                .metadata
                .get("network_request")
                .and_then(Value::as_bool)
                .unwrap_or(false) =>
        {
            "network_requests"
        }
        _ => "general",
    }
}
