//! 核心层：动作模型、操作封装、依赖图与编排器

pub mod action;
pub mod error;
pub mod graph;
pub mod operation;
pub mod orchestrator;

pub use action::{
    Action, ActionExecutor, ActionTarget, ActionType, Coordinate, ModelAdvisor, OperationResult,
    OperationStatus,
};
pub use error::CoreError;
pub use graph::DependencyGraph;
pub use operation::{ExecutionContext, Operation};
pub use orchestrator::OperationOrchestrator;
