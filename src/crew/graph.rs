//! 任务依赖图
//!
//! 使用邻接表和入度表实现 DAG 拓扑排序；同时就绪的任务按声明顺序排列。

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use crate::core::CrewError;
use crate::crew::{TaskId, TaskSpec};

#[derive(Debug, Clone)]
pub struct TaskGraph {
    /// 声明顺序
    order: Vec<TaskId>,
    index: HashMap<TaskId, usize>,
    /// 任务 → 其依赖
    dependencies: HashMap<TaskId, Vec<TaskId>>,
    /// 任务 → 依赖它的任务（按声明顺序）
    adjacency: HashMap<TaskId, Vec<TaskId>>,
}

impl TaskGraph {
    /// 构建并校验：重复 id、未知依赖、环都属于结构性错误
    pub fn build(tasks: &[TaskSpec]) -> Result<Self, CrewError> {
        let mut index = HashMap::with_capacity(tasks.len());
        for (i, task) in tasks.iter().enumerate() {
            if index.insert(task.id.clone(), i).is_some() {
                return Err(CrewError::Structural(format!("duplicate task id '{}'", task.id)));
            }
        }

        let mut dependencies = HashMap::with_capacity(tasks.len());
        let mut adjacency: HashMap<TaskId, Vec<TaskId>> =
            tasks.iter().map(|t| (t.id.clone(), Vec::new())).collect();
        for task in tasks {
            let mut seen = HashSet::new();
            for dep in &task.depends_on {
                if !index.contains_key(dep) {
                    return Err(CrewError::Structural(format!(
                        "task '{}' depends on unknown task '{}'",
                        task.id, dep
                    )));
                }
                if seen.insert(dep.as_str()) {
                    adjacency.entry(dep.clone()).or_default().push(task.id.clone());
                }
            }
            let deps: Vec<TaskId> = task
                .depends_on
                .iter()
                .filter(|d| seen.remove(d.as_str()))
                .cloned()
                .collect();
            dependencies.insert(task.id.clone(), deps);
        }

        let graph = Self {
            order: tasks.iter().map(|t| t.id.clone()).collect(),
            index,
            dependencies,
            adjacency,
        };

        let sorted = graph.topological_order();
        if sorted.len() < graph.order.len() {
            let placed: HashSet<&TaskId> = sorted.iter().collect();
            let cyclic: Vec<&str> = graph
                .order
                .iter()
                .filter(|id| !placed.contains(id))
                .map(String::as_str)
                .collect();
            return Err(CrewError::Structural(format!(
                "dependency cycle among tasks: {}",
                cyclic.join(", ")
            )));
        }
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn task_ids(&self) -> &[TaskId] {
        &self.order
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn dependencies(&self, id: &str) -> &[TaskId] {
        self.dependencies.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn dependents(&self, id: &str) -> &[TaskId] {
        self.adjacency.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// 声明序号，用于 FIFO 排序
    pub fn position(&self, id: &str) -> usize {
        self.index.get(id).copied().unwrap_or(usize::MAX)
    }

    fn in_degrees(&self) -> HashMap<&str, usize> {
        self.order
            .iter()
            .map(|id| (id.as_str(), self.dependencies(id).len()))
            .collect()
    }

    /// Kahn 拓扑排序；存在环时结果短于任务数
    pub fn topological_order(&self) -> Vec<TaskId> {
        let mut in_degree = self.in_degrees();
        let mut ready: BinaryHeap<Reverse<usize>> = self
            .order
            .iter()
            .enumerate()
            .filter(|(_, id)| in_degree.get(id.as_str()) == Some(&0))
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut sorted = Vec::with_capacity(self.order.len());
        while let Some(Reverse(i)) = ready.pop() {
            let id = &self.order[i];
            sorted.push(id.clone());
            for dependent in self.dependents(id) {
                if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(Reverse(self.position(dependent)));
                    }
                }
            }
        }
        sorted
    }

    /// 按层分组：同一层内的任务互不依赖
    pub fn phases(&self) -> Vec<Vec<TaskId>> {
        let mut in_degree = self.in_degrees();
        let mut current: Vec<TaskId> = self
            .order
            .iter()
            .filter(|id| in_degree.get(id.as_str()) == Some(&0))
            .cloned()
            .collect();

        let mut phases = Vec::new();
        while !current.is_empty() {
            let mut next = Vec::new();
            for id in &current {
                for dependent in self.dependents(id) {
                    if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                        *degree -= 1;
                        if *degree == 0 {
                            next.push(dependent.clone());
                        }
                    }
                }
            }
            next.sort_by_key(|id| self.position(id));
            phases.push(std::mem::replace(&mut current, next));
        }
        phases
    }

    /// 所有直接或间接依赖 id 的任务（按声明顺序）
    pub fn transitive_dependents(&self, id: &str) -> Vec<TaskId> {
        let mut seen = HashSet::new();
        let mut stack: Vec<&TaskId> = self.dependents(id).iter().collect();
        while let Some(next) = stack.pop() {
            if seen.insert(next.clone()) {
                stack.extend(self.dependents(next));
            }
        }
        let mut out: Vec<TaskId> = seen.into_iter().collect();
        out.sort_by_key(|t| self.position(t));
        out
    }
}
