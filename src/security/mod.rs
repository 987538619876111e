//! 安全层：规则校验、沙箱模式、确认缓存与审计日志

pub mod guardian;
pub mod rules;

pub use guardian::{SandboxGuard, SecurityContext, SecurityGuardian};
pub use rules::{RuleSetExport, RuleType, SecurityLevel, SecurityRule};
