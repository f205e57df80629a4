//! 单次运行的任务台账
//!
//! 持有执行快照；协调循环与任务 job 共享，锁只在同步代码中短暂持有。

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use serde_json::Value;

use crate::crew::{ErrorRecord, SkipReason, TaskId, TaskOutput, TaskState};
use crate::state::ExecutionSnapshot;

/// 任务的终态结果
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    /// error 非空表示经恢复策略完成
    Succeeded {
        output: TaskOutput,
        error: Option<ErrorRecord>,
    },
    Failed {
        error: ErrorRecord,
    },
}

impl TaskOutcome {
    pub fn state(&self) -> TaskState {
        match self {
            TaskOutcome::Succeeded { .. } => TaskState::Succeeded,
            TaskOutcome::Failed { .. } => TaskState::Failed,
        }
    }
}

pub struct Ledger {
    inner: Mutex<ExecutionSnapshot>,
    /// 本次运行中被跳过任务的原因；加锁顺序总是 inner 在前
    skip_reasons: Mutex<BTreeMap<TaskId, SkipReason>>,
}

impl Ledger {
    pub fn new(snapshot: ExecutionSnapshot) -> Self {
        Self {
            inner: Mutex::new(snapshot),
            skip_reasons: Mutex::new(BTreeMap::new()),
        }
    }

    fn reasons(&self) -> MutexGuard<'_, BTreeMap<TaskId, SkipReason>> {
        self.skip_reasons.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock(&self) -> MutexGuard<'_, ExecutionSnapshot> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> ExecutionSnapshot {
        self.lock().clone()
    }

    /// 运行输入
    pub fn inputs(&self) -> Value {
        self.lock().inputs.clone()
    }

    pub fn state(&self, id: &str) -> TaskState {
        self.lock()
            .task_states
            .get(id)
            .copied()
            .unwrap_or(TaskState::Pending)
    }

    pub fn set_state(&self, id: &str, state: TaskState) {
        self.lock().task_states.insert(id.to_string(), state);
    }

    pub fn output(&self, id: &str) -> Option<TaskOutput> {
        let guard = self.lock();
        match guard.task_states.get(id) {
            Some(TaskState::Succeeded) => guard.task_outputs.get(id).cloned(),
            _ => None,
        }
    }

    /// 指定任务中已成功者的输出
    pub fn outputs_of<'a, I>(&self, ids: I) -> BTreeMap<TaskId, Value>
    where
        I: IntoIterator<Item = &'a TaskId>,
    {
        let guard = self.lock();
        ids.into_iter()
            .filter(|id| guard.task_states.get(*id) == Some(&TaskState::Succeeded))
            .filter_map(|id| guard.task_outputs.get(id).map(|o| (id.clone(), o.value.clone())))
            .collect()
    }

    /// 全部已成功任务的输出
    pub fn succeeded_outputs(&self) -> BTreeMap<TaskId, Value> {
        let guard = self.lock();
        guard
            .task_outputs
            .iter()
            .filter(|(id, _)| guard.task_states.get(*id) == Some(&TaskState::Succeeded))
            .map(|(id, o)| (id.clone(), o.value.clone()))
            .collect()
    }

    /// 记录终态；返回写入后的快照（用于检查点）
    pub fn settle(&self, id: &str, outcome: TaskOutcome) -> ExecutionSnapshot {
        let mut guard = self.lock();
        match outcome {
            TaskOutcome::Succeeded { output, error } => {
                guard.task_states.insert(id.to_string(), TaskState::Succeeded);
                guard.task_outputs.insert(id.to_string(), output);
                if !guard.completed_task_ids.iter().any(|c| c == id) {
                    guard.completed_task_ids.push(id.to_string());
                }
                guard.error_log.extend(error);
            }
            TaskOutcome::Failed { error } => {
                guard.task_states.insert(id.to_string(), TaskState::Failed);
                guard.task_outputs.remove(id);
                guard.error_log.push(error);
            }
        }
        guard.clone()
    }

    /// 跳过尚未终结的任务；已终结则不变
    pub fn skip(&self, id: &str, reason: SkipReason) -> bool {
        let mut guard = self.lock();
        let state = guard.task_states.entry(id.to_string()).or_insert(TaskState::Pending);
        if state.is_terminal() {
            return false;
        }
        *state = TaskState::Skipped;
        self.reasons().insert(id.to_string(), reason);
        true
    }

    /// 跳过全部未终结任务，返回被跳过的 id
    pub fn skip_unfinished(&self, reason: SkipReason) -> Vec<TaskId> {
        let mut guard = self.lock();
        let skipped: Vec<TaskId> = guard
            .task_states
            .iter_mut()
            .filter(|(_, s)| !s.is_terminal())
            .map(|(id, s)| {
                *s = TaskState::Skipped;
                id.clone()
            })
            .collect();
        let mut reasons = self.reasons();
        for id in &skipped {
            reasons.insert(id.clone(), reason);
        }
        skipped
    }

    pub fn skip_reasons(&self) -> BTreeMap<TaskId, SkipReason> {
        self.reasons().clone()
    }

    pub fn push_error(&self, record: ErrorRecord) {
        self.lock().error_log.push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ExecutionContext;
    use crate::recovery::{Classification, ErrorCategory, Severity};
    use serde_json::json;

    fn ledger(ids: &[&str]) -> Ledger {
        Ledger::new(ExecutionSnapshot {
            execution_id: "e".into(),
            crew_type: "c".into(),
            context: ExecutionContext::new("o", "u"),
            inputs: json!({}),
            completed_task_ids: Vec::new(),
            task_states: ids.iter().map(|id| (id.to_string(), TaskState::Pending)).collect(),
            task_outputs: BTreeMap::new(),
            error_log: Vec::new(),
        })
    }

    #[test]
    fn test_settle_and_skip() {
        let ledger = ledger(&["a", "b", "c"]);
        let snap = ledger.settle(
            "a",
            TaskOutcome::Succeeded {
                output: TaskOutput::new("a", json!("done"), 1.0),
                error: None,
            },
        );
        assert_eq!(snap.completed_task_ids, vec!["a"]);

        let classification = Classification {
            category: ErrorCategory::Network,
            severity: Severity::Medium,
            short_circuit: false,
        };
        ledger.settle(
            "b",
            TaskOutcome::Failed {
                error: ErrorRecord::new(Some("b"), &classification, "down"),
            },
        );
        assert!(!ledger.skip("a", SkipReason::UpstreamFailed));
        assert_eq!(ledger.skip_unfinished(SkipReason::BudgetExceeded), vec!["c"]);
        assert_eq!(ledger.state("c"), TaskState::Skipped);
        assert_eq!(ledger.skip_reasons().get("c"), Some(&SkipReason::BudgetExceeded));
        assert!(!ledger.skip_reasons().contains_key("a"));
        assert_eq!(ledger.succeeded_outputs().len(), 1);
        assert_eq!(ledger.outputs_of(["a".to_string(), "b".to_string()].iter()).len(), 1);
        assert_eq!(ledger.snapshot().error_log.len(), 1);
    }
}
