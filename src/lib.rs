//! Opcore - 操作执行核心
//!
//! 模块划分：
//! - **cache**: 有界 LRU 缓存（条目数 + 内存预算）与外部调用记忆化
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: Action/Operation 模型、依赖图、编排器
//! - **observability**: tracing 初始化
//! - **security**: 安全规则、沙箱模式、审计日志
//! - **state**: KV 存储后端、检查点、事务、历史记录
//!
//! 具体的动作执行（屏幕控制 / GitHub API / 模型调用）通过
//! [`core::ActionExecutor`] 注入，本 crate 只负责调度、治理与持久化。

pub mod cache;
pub mod config;
pub mod core;
pub mod observability;
pub mod security;
pub mod state;
