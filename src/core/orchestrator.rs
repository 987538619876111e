//! 操作编排器
//!
//! 单操作执行流水线：安全校验 → 前置校验 → 检查点 → 超时限定的外部执行
//! → 后置校验 → 学习记录。可重试错误按 2^retry_count 秒指数退避重新走完整
//! 流水线（安全校验每次重试都重新执行）；重试耗尽且带回滚钩子时先调钩子、
//! 再恢复检查点，只有恢复成功才报 RolledBack。
//!
//! 批量执行两种形态：execute_sequence 严格从左到右，首个 Failed 即停
//! （除非操作显式要求继续）；execute_parallel 按依赖图分波次推进，
//! 有环或未知依赖在任何操作开始前整批拒绝。取消是协作式的：标记取消
//! 只阻止未来波次调度，不抢占在途工作。

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::cache::PerformanceOptimizer;
use crate::config::OrchestratorSection;
use crate::core::action::{ActionExecutor, OperationResult, OperationStatus};
use crate::core::error::CoreError;
use crate::core::graph::DependencyGraph;
use crate::core::operation::{ExecutionContext, Operation};
use crate::security::SecurityGuardian;
use crate::state::StateManager;

/// 学习样本的持久化步长
const PATTERN_PERSIST_INTERVAL: usize = 10;

/// suggest_optimizations 的建议项
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OptimizationSuggestion {
    /// 相邻且相互独立的操作可以并行
    Parallelize { operations: Vec<String>, reason: String },
    /// (类型, 目标) 重复出现，结果可以缓存
    Cache {
        operation: String,
        similar_to: String,
        reason: String,
    },
}

/// get_workflow_status 的快照
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowStatus {
    /// 在途操作 id
    pub executing: Vec<String>,
    /// 已标记取消的操作 id
    pub cancelled: Vec<String>,
    /// 本进程到达终态的操作总数
    pub completed: usize,
    /// 本进程累计的学习样本数
    pub learned_patterns: usize,
}

/// 顶层执行引擎
pub struct OperationOrchestrator {
    executor: Arc<dyn ActionExecutor>,
    state_manager: Arc<StateManager>,
    guardian: Arc<SecurityGuardian>,
    optimizer: Option<Arc<PerformanceOptimizer>>,
    max_parallel: usize,
    enable_learning: bool,
    /// 在途操作注册表；波次推进与状态查询都读它
    executing: Mutex<HashMap<String, Arc<ExecutionContext>>>,
    /// 协作式取消标记：阻止未来调度，不抢占在途工作
    cancelled: Mutex<HashSet<String>>,
    cancel_token: CancellationToken,
    completed: AtomicUsize,
    patterns: Mutex<Vec<Value>>,
}

impl OperationOrchestrator {
    pub fn new(
        executor: Arc<dyn ActionExecutor>,
        state_manager: Arc<StateManager>,
        guardian: Arc<SecurityGuardian>,
        config: &OrchestratorSection,
    ) -> Self {
        Self {
            executor,
            state_manager,
            guardian,
            optimizer: None,
            max_parallel: config.max_parallel.max(1),
            enable_learning: config.enable_learning,
            executing: Mutex::new(HashMap::new()),
            cancelled: Mutex::new(HashSet::new()),
            cancel_token: CancellationToken::new(),
            completed: AtomicUsize::new(0),
            patterns: Mutex::new(Vec::new()),
        }
    }

    /// 挂接性能优化器，用于并行执行计数等指标
    pub fn with_optimizer(mut self, optimizer: Arc<PerformanceOptimizer>) -> Self {
        self.optimizer = Some(optimizer);
        self
    }

    /// 执行单个操作，带重试 / 回滚的完整错误处理
    pub async fn execute_operation(&self, operation: &mut Operation) -> OperationResult {
        if self.is_cancelled(&operation.id).await {
            tracing::info!("Operation {} skipped: cancelled", operation.id);
            self.completed.fetch_add(1, Ordering::Relaxed);
            return OperationResult::failure(&operation.id, "Operation cancelled")
                .with_status(OperationStatus::Cancelled);
        }

        let mut parent: Option<Arc<ExecutionContext>> = None;
        loop {
            let context = ExecutionContext::new(&operation.id, parent.clone());
            match self.try_execute(operation, &context).await {
                Ok(result) => {
                    tracing::info!(
                        "Operation {} finished with status {:?} after {} retries",
                        operation.id,
                        result.status,
                        operation.retry_count
                    );
                    self.completed.fetch_add(1, Ordering::Relaxed);
                    return result;
                }
                Err(error) => {
                    if error.retryable() && operation.retry_count < operation.max_retries {
                        operation.retry_count += 1;
                        tracing::info!(
                            "Retrying operation {} (attempt {}): {}",
                            operation.id,
                            operation.retry_count,
                            error
                        );
                        tokio::time::sleep(Duration::from_secs(
                            1u64 << operation.retry_count.min(16),
                        ))
                        .await;
                        parent = Some(context);
                        continue;
                    }
                    self.completed.fetch_add(1, Ordering::Relaxed);
                    return self.finalize_failure(operation, &context, error).await;
                }
            }
        }
    }

    /// 单次尝试：安全 → 前置 → 检查点 → 执行 → 后置 → 学习
    async fn try_execute(
        &self,
        operation: &Operation,
        context: &Arc<ExecutionContext>,
    ) -> Result<OperationResult, CoreError> {
        let (allowed, reason) = self.guardian.validate_action(&operation.action);
        if !allowed {
            let reason = reason.unwrap_or_else(|| "Action rejected".to_string());
            tracing::warn!("Operation {} blocked: {}", operation.id, reason);
            return Err(CoreError::PermissionDenied(reason));
        }

        if let Some(pre) = &operation.pre_validation {
            if !pre().await {
                return Err(CoreError::PreValidationFailed(operation.id.clone()));
            }
        }

        // 只有带回滚钩子的操作才值得付出全量快照的代价
        if operation.rollback.is_some() {
            let checkpoint_id = self.state_manager.create_checkpoint().await?;
            context.set_checkpoint(checkpoint_id);
        }

        let result = self.run_action(operation, context).await?;

        if let Some(post) = &operation.post_validation {
            if !post(result.clone()).await {
                return Err(CoreError::PostValidationFailed(operation.id.clone()));
            }
        }

        if self.enable_learning && result.status == OperationStatus::Success {
            self.learn_from_execution(operation, &result).await;
        }

        Ok(result)
    }

    /// 调外部执行器，受 operation.timeout 限定；在途期间登记注册表
    async fn run_action(
        &self,
        operation: &Operation,
        context: &Arc<ExecutionContext>,
    ) -> Result<OperationResult, CoreError> {
        self.executing
            .lock()
            .await
            .insert(operation.id.clone(), context.clone());

        let call = self.executor.execute_action(&operation.action);
        let outcome = match operation.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, call).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.executing.lock().await.remove(&operation.id);
                    tracing::error!("Operation {} timed out", operation.id);
                    return Err(CoreError::Timeout(operation.id.clone()));
                }
            },
            None => call.await,
        };

        self.executing.lock().await.remove(&operation.id);

        let mut result = outcome.map_err(CoreError::ExecutionFailed)?;
        // 执行器只看得到 Action，操作归属由编排器补齐
        result.operation_id = operation.id.clone();
        result.duration =
            Some((Utc::now() - context.start_time).num_milliseconds() as f64 / 1000.0);
        tracing::info!(
            "{}",
            json!({
                "event": "action_executed",
                "operation_id": result.operation_id,
                "action": operation.action.kind,
                "status": result.status,
                "duration_secs": result.duration,
            })
        );
        Ok(result)
    }

    /// 重试耗尽或终态错误的收尾：能回滚则回滚，恢复成功才报 RolledBack
    async fn finalize_failure(
        &self,
        operation: &Operation,
        context: &Arc<ExecutionContext>,
        error: CoreError,
    ) -> OperationResult {
        tracing::error!("Operation {} failed: {}", operation.id, error);

        if let (Some(rollback), Some(checkpoint_id)) = (&operation.rollback, context.checkpoint_id())
        {
            match rollback().await {
                Ok(()) => match self.state_manager.restore_checkpoint(&checkpoint_id).await {
                    Ok(()) => {
                        tracing::info!(
                            "Operation {} rolled back to checkpoint {}",
                            operation.id,
                            checkpoint_id
                        );
                        return OperationResult::failure(&operation.id, error.to_string())
                            .with_status(OperationStatus::RolledBack);
                    }
                    Err(e) => tracing::error!(
                        "Checkpoint restore failed for operation {}: {}",
                        operation.id,
                        e
                    ),
                },
                Err(e) => tracing::error!(
                    "{}",
                    CoreError::RollbackFailed(format!("operation {}: {}", operation.id, e))
                ),
            }
        }

        OperationResult::failure(&operation.id, error.to_string())
    }

    /// 顺序执行：严格从左到右，首个 Failed 即停（除非该操作要求继续）
    pub async fn execute_sequence(&self, operations: Vec<Operation>) -> Vec<OperationResult> {
        let mut results = Vec::with_capacity(operations.len());
        for mut operation in operations {
            let continue_on_failure = operation.continue_on_failure();
            let result = self.execute_operation(&mut operation).await;
            let failed = result.status == OperationStatus::Failed;
            results.push(result);
            if failed && !continue_on_failure {
                break;
            }
        }
        self.append_history(&results).await;
        results
    }

    /// 并行执行：按依赖图分波次推进
    ///
    /// 波次 N+1 绝不早于波次 N 内所有操作到达终态；失败不阻塞同波次
    /// 兄弟操作，但会照常解除后继依赖（由后继自行决定语义）。
    pub async fn execute_parallel(
        &self,
        operations: Vec<Operation>,
    ) -> Result<Vec<OperationResult>, CoreError> {
        let mut graph = DependencyGraph::new(&operations)?;
        let mut pending: HashMap<String, Operation> = operations
            .into_iter()
            .map(|op| (op.id.clone(), op))
            .collect();
        let mut results = Vec::with_capacity(pending.len());

        while !graph.is_empty() {
            let ready: Vec<String> = graph
                .ready()
                .into_iter()
                .take(self.max_parallel)
                .collect();

            let mut wave = Vec::new();
            for id in ready {
                if self.is_cancelled(&id).await {
                    tracing::info!("Operation {} skipped: cancelled", id);
                    graph.complete(&id);
                    pending.remove(&id);
                    self.completed.fetch_add(1, Ordering::Relaxed);
                    results.push(
                        OperationResult::failure(&id, "Operation cancelled")
                            .with_status(OperationStatus::Cancelled),
                    );
                    continue;
                }
                if let Some(operation) = pending.remove(&id) {
                    wave.push(operation);
                }
            }
            if wave.is_empty() {
                continue;
            }

            tracing::debug!("Executing wave of {} operations", wave.len());
            if let Some(optimizer) = &self.optimizer {
                optimizer.record_parallel_execution(wave.len()).await;
            }

            let wave_results = join_all(
                wave.into_iter()
                    .map(|mut operation| async move { self.execute_operation(&mut operation).await }),
            )
            .await;

            for result in wave_results {
                graph.complete(&result.operation_id);
                results.push(result);
            }
        }

        self.append_history(&results).await;
        Ok(results)
    }

    /// 批量结果落入持久历史；历史写入失败不影响执行结果
    async fn append_history(&self, results: &[OperationResult]) {
        if results.is_empty() {
            return;
        }
        if let Err(e) = self.state_manager.save_operation_history(results).await {
            tracing::warn!("Failed to append operation history: {}", e);
        }
    }

    /// 基于结构的启发式优化建议（不依赖学习样本）
    pub fn suggest_optimizations(&self, operations: &[Operation]) -> Vec<OptimizationSuggestion> {
        let mut suggestions = Vec::new();

        for window in operations.windows(2) {
            let (op, next) = (&window[0], &window[1]);
            if next.dependencies.is_empty() && can_parallelize(op, next) {
                suggestions.push(OptimizationSuggestion::Parallelize {
                    operations: vec![op.id.clone(), next.id.clone()],
                    reason: "No dependencies between operations".to_string(),
                });
            }
        }

        let mut seen: HashMap<(String, String), String> = HashMap::new();
        for op in operations {
            let key = (
                format!("{:?}", op.action.kind),
                op.action
                    .target
                    .as_ref()
                    .map(|t| t.to_string())
                    .unwrap_or_default(),
            );
            match seen.get(&key) {
                Some(first) => suggestions.push(OptimizationSuggestion::Cache {
                    operation: op.id.clone(),
                    similar_to: first.clone(),
                    reason: "Duplicate operation detected".to_string(),
                }),
                None => {
                    seen.insert(key, op.id.clone());
                }
            }
        }

        suggestions
    }

    /// 标记单个操作取消；只影响尚未调度的执行
    pub async fn cancel(&self, operation_id: &str) {
        self.cancelled
            .lock()
            .await
            .insert(operation_id.to_string());
        tracing::info!("Operation {} marked cancelled", operation_id);
    }

    /// 取消所有后续调度（在途操作照常跑完）
    pub fn cancel_all(&self) {
        tracing::warn!("Cancelling all pending operations");
        self.cancel_token.cancel();
    }

    async fn is_cancelled(&self, operation_id: &str) -> bool {
        self.cancel_token.is_cancelled() || self.cancelled.lock().await.contains(operation_id)
    }

    pub async fn get_workflow_status(&self) -> WorkflowStatus {
        WorkflowStatus {
            executing: self.executing.lock().await.keys().cloned().collect(),
            cancelled: self.cancelled.lock().await.iter().cloned().collect(),
            completed: self.completed.load(Ordering::Relaxed),
            learned_patterns: self.patterns.lock().await.len(),
        }
    }

    /// 最近的操作历史（委托给状态管理器）
    pub async fn get_operation_history(&self, limit: usize) -> Vec<OperationResult> {
        self.state_manager.get_operation_history(limit).await
    }

    /// 把一批结果追加进持久历史
    pub async fn record_results(
        &self,
        results: &[OperationResult],
    ) -> Result<(), crate::state::StateError> {
        self.state_manager.save_operation_history(results).await
    }

    /// 记录学习样本；每满 10 条持久化一次
    async fn learn_from_execution(&self, operation: &Operation, result: &OperationResult) {
        let pattern = json!({
            "action_type": operation.action.kind,
            "metadata": operation.action.metadata,
            "duration": result.duration,
            "timestamp": result.timestamp,
        });

        let snapshot = {
            let mut patterns = self.patterns.lock().await;
            patterns.push(pattern);
            (patterns.len() % PATTERN_PERSIST_INTERVAL == 0)
                .then(|| Value::Array(patterns.clone()))
        };

        if let Some(snapshot) = snapshot {
            if let Err(e) = self
                .state_manager
                .save_state("execution_patterns", snapshot)
                .await
            {
                tracing::warn!("Failed to persist execution patterns: {}", e);
            }
        }
    }
}

/// 两个操作能否并行：目标不同，且都不是必须串行的动作类型
fn can_parallelize(a: &Operation, b: &Operation) -> bool {
    if a.action.target == b.action.target {
        return false;
    }
    !(a.action.kind.is_strictly_sequential() || b.action.kind.is_strictly_sequential())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use futures_util::FutureExt;
    use serde_json::json;

    use crate::config::{OrchestratorSection, SecuritySection};
    use crate::core::action::{Action, ActionTarget, ActionType};
    use crate::state::MemoryStateStore;

    /// 前 fail_times 次调用失败，之后成功；记录执行顺序
    struct MockExecutor {
        fail_times: usize,
        calls: AtomicUsize,
        delay: Option<Duration>,
        order: Mutex<Vec<String>>,
    }

    impl MockExecutor {
        fn succeeding() -> Self {
            Self::failing(0)
        }

        fn failing(fail_times: usize) -> Self {
            Self {
                fail_times,
                calls: AtomicUsize::new(0),
                delay: None,
                order: Mutex::new(Vec::new()),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ActionExecutor for MockExecutor {
        async fn execute_action(&self, action: &Action) -> Result<OperationResult, String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(name) = action.metadata.get("name").and_then(Value::as_str) {
                self.order.lock().await.push(name.to_string());
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if call < self.fail_times {
                return Err("transient failure".to_string());
            }
            Ok(OperationResult::success(&action.id, Some(json!("ok"))))
        }

        fn supported_action_types(&self) -> Vec<ActionType> {
            vec![ActionType::Click, ActionType::Wait, ActionType::Screenshot]
        }
    }

    fn manager() -> Arc<StateManager> {
        Arc::new(StateManager::new(
            Arc::new(MemoryStateStore::new()),
            "memory",
            None,
        ))
    }

    fn guardian() -> Arc<SecurityGuardian> {
        Arc::new(SecurityGuardian::new(SecuritySection {
            enable_sandbox: false,
            ..SecuritySection::default()
        }))
    }

    fn orchestrator(executor: Arc<MockExecutor>) -> OperationOrchestrator {
        OperationOrchestrator::new(
            executor,
            manager(),
            guardian(),
            &OrchestratorSection::default(),
        )
    }

    fn click_op(name: &str) -> Operation {
        Operation::new(
            Action::new(ActionType::Click)
                .with_target(ActionTarget::Named(name.to_string()))
                .with_metadata("name", name),
        )
        .with_id(name)
    }

    #[tokio::test]
    async fn test_success_path_sets_duration() {
        let executor = Arc::new(MockExecutor::succeeding());
        let orch = orchestrator(executor.clone());
        let mut op = click_op("a");

        let result = orch.execute_operation(&mut op).await;
        assert_eq!(result.status, OperationStatus::Success);
        assert_eq!(result.operation_id, "a");
        assert!(result.duration.is_some());
        assert_eq!(executor.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_with_backoff_until_success() {
        let executor = Arc::new(MockExecutor::failing(2));
        let orch = orchestrator(executor.clone());
        let mut op = click_op("a").with_max_retries(3);

        let result = orch.execute_operation(&mut op).await;
        assert_eq!(result.status, OperationStatus::Success);
        assert_eq!(executor.call_count(), 3);
        assert_eq!(op.retry_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_returns_failed() {
        let executor = Arc::new(MockExecutor::failing(usize::MAX));
        let orch = orchestrator(executor.clone());
        let mut op = click_op("a").with_max_retries(1);

        let result = orch.execute_operation(&mut op).await;
        assert_eq!(result.status, OperationStatus::Failed);
        assert_eq!(executor.call_count(), 2);
        assert!(result.error.unwrap().contains("Execution failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retried_then_failed() {
        let executor = Arc::new(MockExecutor {
            delay: Some(Duration::from_secs(60)),
            ..MockExecutor::succeeding()
        });
        let orch = orchestrator(executor.clone());
        let mut op = click_op("a")
            .with_timeout(Duration::from_secs(1))
            .with_max_retries(1);

        let result = orch.execute_operation(&mut op).await;
        assert_eq!(result.status, OperationStatus::Failed);
        assert_eq!(executor.call_count(), 2);
        assert!(result.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_security_rejection_is_terminal() {
        let executor = Arc::new(MockExecutor::succeeding());
        let sandboxed = Arc::new(SecurityGuardian::new(SecuritySection::default()));
        let orch = OperationOrchestrator::new(
            executor.clone(),
            manager(),
            sandboxed,
            &OrchestratorSection::default(),
        );
        let mut op = Operation::new(Action::new(ActionType::Execute).with_value("ls"))
            .with_max_retries(3);

        let result = orch.execute_operation(&mut op).await;
        assert_eq!(result.status, OperationStatus::Failed);
        assert_eq!(executor.call_count(), 0);
        assert_eq!(
            result.error.as_deref(),
            Some("Action not allowed in sandbox mode")
        );
    }

    #[tokio::test]
    async fn test_pre_validation_failure_not_retried() {
        let executor = Arc::new(MockExecutor::succeeding());
        let orch = orchestrator(executor.clone());
        let mut op = click_op("a")
            .with_max_retries(3)
            .with_pre_validation(Arc::new(|| async { false }.boxed()));

        let result = orch.execute_operation(&mut op).await;
        assert_eq!(result.status, OperationStatus::Failed);
        assert_eq!(executor.call_count(), 0);
        assert_eq!(op.retry_count, 0);
    }

    #[tokio::test]
    async fn test_post_validation_failure_not_retried() {
        let executor = Arc::new(MockExecutor::succeeding());
        let orch = orchestrator(executor.clone());
        let mut op = click_op("a")
            .with_max_retries(3)
            .with_post_validation(Arc::new(|_result| async { false }.boxed()));

        let result = orch.execute_operation(&mut op).await;
        assert_eq!(result.status, OperationStatus::Failed);
        assert_eq!(executor.call_count(), 1);
        assert!(result.error.unwrap().contains("Post-validation failed"));
    }

    /// 执行前写脏状态再失败的执行器，验证回滚恢复
    struct SabotagingExecutor {
        manager: Arc<StateManager>,
    }

    #[async_trait]
    impl ActionExecutor for SabotagingExecutor {
        async fn execute_action(&self, _action: &Action) -> Result<OperationResult, String> {
            self.manager
                .save_state("doc", json!("dirty"))
                .await
                .map_err(|e| e.to_string())?;
            Err("boom".to_string())
        }

        fn supported_action_types(&self) -> Vec<ActionType> {
            vec![ActionType::Click]
        }
    }

    #[tokio::test]
    async fn test_rollback_restores_checkpoint() {
        let manager = manager();
        manager.save_state("doc", json!("clean")).await.unwrap();

        let orch = OperationOrchestrator::new(
            Arc::new(SabotagingExecutor {
                manager: manager.clone(),
            }),
            manager.clone(),
            guardian(),
            &OrchestratorSection::default(),
        );
        let mut op = click_op("a")
            .with_max_retries(0)
            .with_rollback(Arc::new(|| async { Ok(()) }.boxed()));

        let result = orch.execute_operation(&mut op).await;
        assert_eq!(result.status, OperationStatus::RolledBack);
        assert_eq!(manager.load_state("doc").await, Some(json!("clean")));
    }

    #[tokio::test]
    async fn test_failed_rollback_hook_reports_failed() {
        let executor = Arc::new(MockExecutor::failing(usize::MAX));
        let orch = orchestrator(executor);
        let mut op = click_op("a")
            .with_max_retries(0)
            .with_rollback(Arc::new(|| async { Err("hook broken".to_string()) }.boxed()));

        let result = orch.execute_operation(&mut op).await;
        // 回滚钩子失败时不得谎报 RolledBack
        assert_eq!(result.status, OperationStatus::Failed);
    }

    #[tokio::test]
    async fn test_sequence_stops_at_first_failure() {
        let executor = Arc::new(MockExecutor::failing(usize::MAX));
        let orch = orchestrator(executor.clone());
        let ops = vec![
            click_op("a").with_max_retries(0),
            click_op("b").with_max_retries(0),
        ];

        let results = orch.execute_sequence(ops).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, OperationStatus::Failed);
        assert_eq!(executor.call_count(), 1);
    }

    #[tokio::test]
    async fn test_sequence_continue_on_failure() {
        let executor = Arc::new(MockExecutor::failing(1));
        let orch = orchestrator(executor.clone());
        let ops = vec![
            click_op("a")
                .with_max_retries(0)
                .with_metadata("continue_on_failure", true),
            click_op("b").with_max_retries(0),
        ];

        let results = orch.execute_sequence(ops).await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].status, OperationStatus::Failed);
        assert_eq!(results[1].status, OperationStatus::Success);
    }

    #[tokio::test]
    async fn test_parallel_waves_respect_dependencies() {
        let executor = Arc::new(MockExecutor::succeeding());
        let orch = orchestrator(executor.clone());
        let ops = vec![
            click_op("c").depends_on("a").depends_on("b"),
            click_op("a"),
            click_op("b"),
        ];

        let results = orch.execute_parallel(ops).await.unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.status == OperationStatus::Success));

        let order = executor.order.lock().await.clone();
        let pos = |name: &str| order.iter().position(|n| n == name).unwrap();
        assert!(pos("a") < pos("c"));
        assert!(pos("b") < pos("c"));
    }

    #[tokio::test]
    async fn test_parallel_cycle_rejected_before_execution() {
        let executor = Arc::new(MockExecutor::succeeding());
        let orch = orchestrator(executor.clone());
        let ops = vec![click_op("a").depends_on("b"), click_op("b").depends_on("a")];

        let err = orch.execute_parallel(ops).await.unwrap_err();
        assert!(matches!(err, CoreError::CyclicDependency));
        assert_eq!(executor.call_count(), 0);
    }

    #[tokio::test]
    async fn test_parallel_respects_max_parallel() {
        let executor = Arc::new(MockExecutor::succeeding());
        let orch = OperationOrchestrator::new(
            executor.clone(),
            manager(),
            guardian(),
            &OrchestratorSection {
                max_parallel: 1,
                enable_learning: false,
            },
        );
        let ops = vec![click_op("a"), click_op("b"), click_op("c")];

        let results = orch.execute_parallel(ops).await.unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.status == OperationStatus::Success));
    }

    #[tokio::test]
    async fn test_cancelled_operation_not_scheduled() {
        let executor = Arc::new(MockExecutor::succeeding());
        let orch = orchestrator(executor.clone());
        orch.cancel("b").await;
        let ops = vec![click_op("a"), click_op("b")];

        let results = orch.execute_parallel(ops).await.unwrap();
        let by_id: HashMap<_, _> = results.iter().map(|r| (r.operation_id.clone(), r)).collect();
        assert_eq!(by_id["a"].status, OperationStatus::Success);
        assert_eq!(by_id["b"].status, OperationStatus::Cancelled);
        assert_eq!(executor.call_count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_all_blocks_future_scheduling() {
        let executor = Arc::new(MockExecutor::succeeding());
        let orch = orchestrator(executor.clone());
        orch.cancel_all();

        let mut op = click_op("a");
        let result = orch.execute_operation(&mut op).await;
        assert_eq!(result.status, OperationStatus::Cancelled);
        assert_eq!(executor.call_count(), 0);
    }

    #[tokio::test]
    async fn test_suggest_parallelize_for_independent_ops() {
        let orch = orchestrator(Arc::new(MockExecutor::succeeding()));
        let ops = vec![click_op("a"), click_op("b")];

        let suggestions = orch.suggest_optimizations(&ops);
        assert!(suggestions.iter().any(|s| matches!(
            s,
            OptimizationSuggestion::Parallelize { operations, .. }
                if operations == &vec!["a".to_string(), "b".to_string()]
        )));
    }

    #[tokio::test]
    async fn test_no_parallelize_for_sequential_types_or_shared_target() {
        let orch = orchestrator(Arc::new(MockExecutor::succeeding()));

        let typing = vec![
            Operation::new(
                Action::new(ActionType::Type).with_target(ActionTarget::Named("a".into())),
            ),
            Operation::new(
                Action::new(ActionType::Type).with_target(ActionTarget::Named("b".into())),
            ),
        ];
        assert!(!orch
            .suggest_optimizations(&typing)
            .iter()
            .any(|s| matches!(s, OptimizationSuggestion::Parallelize { .. })));

        let shared = vec![click_op("x").with_id("s1"), {
            let mut op = click_op("x");
            op.id = "s2".to_string();
            op
        }];
        assert!(!orch
            .suggest_optimizations(&shared)
            .iter()
            .any(|s| matches!(s, OptimizationSuggestion::Parallelize { .. })));
    }

    #[tokio::test]
    async fn test_suggest_cache_for_duplicates() {
        let orch = orchestrator(Arc::new(MockExecutor::succeeding()));
        let shared = vec![click_op("x").with_id("s1"), {
            let mut op = click_op("x");
            op.id = "s2".to_string();
            op
        }];

        let suggestions = orch.suggest_optimizations(&shared);
        assert!(suggestions.iter().any(|s| matches!(
            s,
            OptimizationSuggestion::Cache { operation, similar_to, .. }
                if operation == "s2" && similar_to == "s1"
        )));
    }

    #[tokio::test]
    async fn test_patterns_persisted_every_tenth_sample() {
        let manager = manager();
        let orch = OperationOrchestrator::new(
            Arc::new(MockExecutor::succeeding()),
            manager.clone(),
            guardian(),
            &OrchestratorSection::default(),
        );

        for i in 0..10 {
            let mut op = click_op(&format!("op-{i}"));
            orch.execute_operation(&mut op).await;
        }

        let patterns = manager.load_state("execution_patterns").await.unwrap();
        assert_eq!(patterns.as_array().unwrap().len(), 10);
        let status = orch.get_workflow_status().await;
        assert_eq!(status.learned_patterns, 10);
        assert_eq!(status.completed, 10);
    }

    #[tokio::test]
    async fn test_history_round_trip_through_orchestrator() {
        let orch = orchestrator(Arc::new(MockExecutor::succeeding()));
        let mut op = click_op("a");
        let result = orch.execute_operation(&mut op).await;
        orch.record_results(&[result]).await.unwrap();

        let history = orch.get_operation_history(10).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].operation_id, "a");
    }

    #[tokio::test]
    async fn test_workflow_status_empty_when_idle() {
        let orch = orchestrator(Arc::new(MockExecutor::succeeding()));
        let status = orch.get_workflow_status().await;
        assert!(status.executing.is_empty());
        assert!(status.cancelled.is_empty());
    }
}
