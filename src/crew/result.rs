//! Crew 运行结果
//!
//! 每次运行恰好产生一个 CrewResult；即使降级或被取消，success / confidence / errors 也总是完整的。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::crew::{ErrorRecord, SkipReason, TaskId, TaskOutput, TaskSpec, TaskState};
use crate::state::ExecutionSnapshot;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrewResult {
    pub success: bool,
    /// 0..=1，按任务权重加权
    pub confidence: f64,
    /// 成功任务的输出（task_id → value）
    pub results: BTreeMap<TaskId, Value>,
    pub errors: Vec<ErrorRecord>,
    pub metadata: Map<String, Value>,
}

impl CrewResult {
    /// 由任务终态组装结果
    ///
    /// - confidence：成功任务按 weight 加权，失败 / 跳过计 0
    /// - success：每个关键任务都以非降级输出成功，或因 terminate / manager 决定被主动跳过；
    ///   且运行未超出时间预算
    pub fn assemble(
        tasks: &[TaskSpec],
        states: &BTreeMap<TaskId, TaskState>,
        outputs: &BTreeMap<TaskId, TaskOutput>,
        skip_reasons: &BTreeMap<TaskId, SkipReason>,
        errors: Vec<ErrorRecord>,
        budget_exceeded: bool,
        mut metadata: Map<String, Value>,
    ) -> Self {
        let mut weighted = 0.0;
        let mut total_weight = 0.0;
        let mut success = !budget_exceeded;
        let mut degraded = budget_exceeded;

        for task in tasks {
            total_weight += task.weight;
            let state = states.get(&task.id).copied().unwrap_or(TaskState::Pending);
            let output = outputs.get(&task.id).filter(|_| state == TaskState::Succeeded);
            if let Some(output) = output {
                weighted += task.weight * output.confidence;
                degraded |= output.degraded;
            }
            if !task.critical {
                continue;
            }
            let completed = match state {
                TaskState::Succeeded => output.is_some_and(|o| !o.degraded),
                TaskState::Skipped => skip_reasons.get(&task.id).is_some_and(SkipReason::is_intentional),
                _ => false,
            };
            if !completed {
                success = false;
            }
        }

        let confidence = if total_weight > 0.0 {
            (weighted / total_weight).clamp(0.0, 1.0)
        } else {
            0.0
        };

        metadata.insert("task_states".into(), json!(states));
        metadata.insert("degraded".into(), json!(degraded));
        metadata.insert("budget_exceeded".into(), json!(budget_exceeded));
        if !skip_reasons.is_empty() {
            metadata.insert("skip_reasons".into(), json!(skip_reasons));
        }

        Self {
            success,
            confidence,
            results: Self::collect_results(states, outputs),
            errors,
            metadata,
        }
    }

    /// 由最后一个检查点构造结果（取消或中断后查询），所有任务等权
    pub fn from_snapshot(snapshot: &ExecutionSnapshot, mut metadata: Map<String, Value>) -> Self {
        let total = snapshot.task_states.len();
        let confidence = if total == 0 {
            0.0
        } else {
            snapshot
                .task_states
                .iter()
                .filter(|(_, s)| **s == TaskState::Succeeded)
                .filter_map(|(id, _)| snapshot.task_outputs.get(id))
                .map(|o| o.confidence)
                .sum::<f64>()
                / total as f64
        };
        metadata.insert("task_states".into(), json!(snapshot.task_states));
        metadata.insert("completed_task_ids".into(), json!(snapshot.completed_task_ids));
        Self {
            success: false,
            confidence: confidence.clamp(0.0, 1.0),
            results: Self::collect_results(&snapshot.task_states, &snapshot.task_outputs),
            errors: snapshot.error_log.clone(),
            metadata,
        }
    }

    /// 尚未写入任何检查点时的空结果
    pub fn empty(metadata: Map<String, Value>) -> Self {
        Self {
            success: false,
            confidence: 0.0,
            results: BTreeMap::new(),
            errors: Vec::new(),
            metadata,
        }
    }

    fn collect_results(
        states: &BTreeMap<TaskId, TaskState>,
        outputs: &BTreeMap<TaskId, TaskOutput>,
    ) -> BTreeMap<TaskId, Value> {
        outputs
            .iter()
            .filter(|(id, _)| states.get(*id) == Some(&TaskState::Succeeded))
            .map(|(id, o)| (id.clone(), o.value.clone()))
            .collect()
    }

    pub fn is_degraded(&self) -> bool {
        self.metadata
            .get("degraded")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}
