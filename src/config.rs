//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `OPCORE__*` 覆盖（双下划线表示嵌套，
//! 如 `OPCORE__STATE__BACKEND=memory`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub state: StateSection,
    #[serde(default)]
    pub security: SecuritySection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            state: StateSection::default(),
            security: SecuritySection::default(),
            cache: CacheSection::default(),
            orchestrator: OrchestratorSection::default(),
        }
    }
}

/// [state] 段：存储后端与默认 TTL
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StateSection {
    /// 后端类型：file / memory
    pub backend: String,
    /// 文件后端的根目录
    pub path: PathBuf,
    /// save_state 写入的默认 TTL（秒），0 表示不过期
    pub ttl_secs: u64,
}

impl Default for StateSection {
    fn default() -> Self {
        Self {
            backend: "file".to_string(),
            path: PathBuf::from("./state"),
            ttl_secs: 3600,
        }
    }
}

/// [security] 段：沙箱、确认类别、黑名单与敏感模式
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SecuritySection {
    /// 默认是否开启沙箱模式
    pub enable_sandbox: bool,
    /// 需要交互确认的动作类别
    pub require_confirmation: Vec<String>,
    /// 系统命令黑名单（字面匹配，忽略大小写）
    pub blacklisted_commands: Vec<String>,
    /// 敏感数据正则模式
    pub sensitive_patterns: Vec<String>,
    /// 单次操作载荷上限（字节）
    pub max_file_size: u64,
    /// 出站请求允许的域名
    pub allowed_domains: Vec<String>,
}

impl Default for SecuritySection {
    fn default() -> Self {
        Self {
            enable_sandbox: true,
            require_confirmation: vec![
                "system_commands".into(),
                "file_deletion".into(),
                "network_requests".into(),
            ],
            blacklisted_commands: vec![
                "rm -rf /".into(),
                "format".into(),
                "del /s /q".into(),
            ],
            sensitive_patterns: vec![
                r"password\s*=".into(),
                r"api[_-]?key\s*=".into(),
                r"secret\s*=".into(),
                r"token\s*=".into(),
                r"private[_-]?key".into(),
            ],
            max_file_size: 100_000_000,
            allowed_domains: vec![
                "github.com".into(),
                "gitlab.com".into(),
                "bitbucket.org".into(),
            ],
        }
    }
}

/// [cache] 段：LRU 预算与记忆化 TTL
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    /// 最大条目数
    pub max_entries: usize,
    /// 最大内存占用（MB）
    pub max_memory_mb: usize,
    /// 模型响应缓存 TTL（秒）；屏幕状态会变化，保持较短
    pub model_response_ttl_secs: u64,
    /// 屏幕截图缓存 TTL（秒）
    pub screenshot_ttl_secs: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            max_memory_mb: 100,
            model_response_ttl_secs: 300,
            screenshot_ttl_secs: 2,
        }
    }
}

/// [orchestrator] 段：并发上限与模式学习开关
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    /// 每个执行波次的最大并发操作数
    pub max_parallel: usize,
    /// 成功执行后是否记录学习样本
    pub enable_learning: bool,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            enable_learning: true,
        }
    }
}

/// 从 config 目录加载配置，环境变量 OPCORE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 OPCORE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("OPCORE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.state.backend, "file");
        assert_eq!(cfg.state.ttl_secs, 3600);
        assert!(cfg.security.enable_sandbox);
        assert_eq!(cfg.orchestrator.max_parallel, 4);
        assert_eq!(cfg.cache.max_entries, 1000);
    }

    #[test]
    fn test_load_config_without_file() {
        // 无配置文件时应退回默认值
        let cfg = load_config(Some(PathBuf::from("/nonexistent/opcore.toml"))).unwrap();
        assert_eq!(cfg.cache.max_memory_mb, 100);
        assert!(cfg
            .security
            .blacklisted_commands
            .iter()
            .any(|c| c == "rm -rf /"));
    }
}
