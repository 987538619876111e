//! 核心错误类型与重试策略
//!
//! 编排器根据错误变体决定是否重试：权限拒绝与前/后置校验失败是终态，
//! 超时与一般执行故障可按指数退避重试，依赖图问题在调度前即致命。

use thiserror::Error;

/// 操作执行过程中的错误分类
#[derive(Error, Debug)]
pub enum CoreError {
    /// 安全规则或沙箱拒绝；只携带人类可读原因，永不重试
    #[error("{0}")]
    PermissionDenied(String),

    /// 前置校验失败（调用方 / 数据错误），不重试
    #[error("Pre-validation failed: {0}")]
    PreValidationFailed(String),

    /// 后置校验失败（调用方 / 数据错误），不重试
    #[error("Post-validation failed: {0}")]
    PostValidationFailed(String),

    /// 执行超时，可重试
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// 一般执行故障，可重试
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    /// 依赖图存在环，整批拒绝执行
    #[error("Circular dependency detected in operations")]
    CyclicDependency,

    /// 依赖了本批次之外的操作 id，整批拒绝执行
    #[error("Unknown dependency '{0}' in operation batch")]
    UnknownDependency(String),

    /// 回滚钩子本身失败（仅记录，最终状态由检查点恢复决定）
    #[error("Rollback failed: {0}")]
    RollbackFailed(String),

    /// 状态层错误
    #[error(transparent)]
    State(#[from] crate::state::StateError),
}

impl CoreError {
    /// 是否允许按退避策略重试
    pub fn retryable(&self) -> bool {
        matches!(self, CoreError::Timeout(_) | CoreError::ExecutionFailed(_))
    }
}
