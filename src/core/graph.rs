//! 操作依赖图
//!
//! 邻接表 + 入度表。构建时即做 Kahn 拓扑检查：有环或引用了批次外的
//! 依赖 id 都在任何操作开始前整批拒绝。

use std::collections::{HashMap, HashSet};

use crate::core::error::CoreError;
use crate::core::operation::Operation;

/// 一批操作的依赖图；ready/complete 驱动波次执行
#[derive(Debug)]
pub struct DependencyGraph {
    /// 操作 id -> 尚未满足的依赖集合
    remaining: HashMap<String, HashSet<String>>,
    /// 依赖 id -> 依赖它的操作列表
    dependents: HashMap<String, Vec<String>>,
    /// 输入顺序，保证波次选择的确定性
    order: Vec<String>,
}

impl DependencyGraph {
    /// 构建并校验依赖图；有环或未知依赖返回错误，此时整批不执行
    pub fn new(operations: &[Operation]) -> Result<Self, CoreError> {
        let ids: HashSet<&str> = operations.iter().map(|op| op.id.as_str()).collect();

        let mut remaining: HashMap<String, HashSet<String>> = HashMap::new();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        let mut order = Vec::with_capacity(operations.len());

        for op in operations {
            for dep in &op.dependencies {
                if !ids.contains(dep.as_str()) {
                    return Err(CoreError::UnknownDependency(dep.clone()));
                }
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(op.id.clone());
            }
            remaining.insert(op.id.clone(), op.dependencies.clone());
            order.push(op.id.clone());
        }

        let graph = Self {
            remaining,
            dependents,
            order,
        };
        if graph.has_cycle() {
            return Err(CoreError::CyclicDependency);
        }
        Ok(graph)
    }

    /// Kahn 拓扑排序检环
    fn has_cycle(&self) -> bool {
        let mut in_degree: HashMap<&str, usize> = self
            .remaining
            .iter()
            .map(|(id, deps)| (id.as_str(), deps.len()))
            .collect();

        let mut queue: Vec<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0usize;

        while let Some(id) = queue.pop() {
            visited += 1;
            if let Some(deps) = self.dependents.get(id) {
                for dependent in deps {
                    if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push(dependent);
                        }
                    }
                }
            }
        }

        visited != self.remaining.len()
    }

    /// 依赖已全部满足、尚未调度的操作（按输入顺序）
    pub fn ready(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| {
                self.remaining
                    .get(id.as_str())
                    .map(|deps| deps.is_empty())
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    /// 标记操作到达终态（成功或失败都解除依赖），从图中移除
    pub fn complete(&mut self, operation_id: &str) {
        self.remaining.remove(operation_id);
        if let Some(deps) = self.dependents.get(operation_id) {
            for dependent in deps.clone() {
                if let Some(remaining) = self.remaining.get_mut(&dependent) {
                    remaining.remove(operation_id);
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.remaining.is_empty()
    }

    pub fn len(&self) -> usize {
        self.remaining.len()
    }
}
