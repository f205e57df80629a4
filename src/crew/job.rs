//! 单个任务的执行单元
//!
//! 首次执行失败后交给恢复引擎；TaskJob 同时实现 RecoverableTask，供引擎重跑、查上次结果或走规则兜底。

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use serde_json::Value;

use crate::core::CrewError;
use crate::crew::agent::{Agent, InvocationOptions};
use crate::crew::ledger::{Ledger, TaskOutcome};
use crate::crew::{ErrorRecord, TaskId, TaskInput, TaskOutput, TaskSpec, TaskState};
use crate::recovery::{ErrorClassifier, RecoverableTask, RecoveryEngine, RecoveryResult};
use crate::state::StateStore;

pub struct TaskJob {
    pub task: TaskSpec,
    pub agent: Arc<Agent>,
    pub input: TaskInput,
    pub options: InvocationOptions,
    pub ledger: Arc<Ledger>,
    pub store: Arc<dyn StateStore>,
    /// 上次成功输出的存储键；crew 关闭缓存时为 None
    pub last_output_key: Option<String>,
}

impl TaskJob {
    /// 执行并捕获 panic；返回 (task_id, 结果)
    pub async fn run(self, recovery: RecoveryEngine) -> (TaskId, Result<TaskOutcome, CrewError>) {
        let id = self.task.id.clone();
        let result = AssertUnwindSafe(self.execute(recovery))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let error = CrewError::Systemic(format!("task panicked: {}", panic_message(panic.as_ref())));
                tracing::error!(task_id = %id, error = %error, "task panicked");
                Ok(TaskOutcome::Failed {
                    error: ErrorRecord::new(Some(&id), &ErrorClassifier::classify(&error), error.to_string()),
                })
            });
        (id, result)
    }

    async fn execute(&self, recovery: RecoveryEngine) -> Result<TaskOutcome, CrewError> {
        let id = self.task.id.as_str();
        self.ledger.set_state(id, TaskState::Running);
        tracing::debug!(task_id = %id, agent = %self.agent.name(), "task started");

        let error = match self.attempt(false).await {
            Ok((value, confidence)) => {
                return Ok(TaskOutcome::Succeeded {
                    output: TaskOutput::new(id, value, confidence),
                    error: None,
                });
            }
            Err(e) if e.propagates() => return Err(e),
            Err(e) => e,
        };

        let message = error.to_string();
        tracing::warn!(task_id = %id, error = %message, "task failed, entering recovery");
        self.ledger.set_state(id, TaskState::Recovering);

        match recovery.recover(self, error).await {
            RecoveryResult::Recovered {
                outcome,
                classification,
                ..
            } => Ok(TaskOutcome::Succeeded {
                output: TaskOutput::new(id, outcome.data, outcome.confidence).recovered(outcome.strategy),
                error: Some(ErrorRecord::new(Some(id), &classification, message).recovered_by(outcome.strategy)),
            }),
            RecoveryResult::Exhausted {
                error,
                classification,
                tried,
            } => {
                tracing::warn!(task_id = %id, category = %classification.category, strategies = tried.len(), "recovery exhausted");
                Ok(TaskOutcome::Failed {
                    error: ErrorRecord::new(Some(id), &classification, error.to_string()),
                })
            }
            RecoveryResult::Propagate(e) => Err(e),
        }
    }

    async fn attempt(&self, simplified: bool) -> Result<(Value, f64), CrewError> {
        let input = if simplified {
            TaskInput {
                simplified: true,
                ..self.input.clone()
            }
        } else {
            self.input.clone()
        };
        self.agent.perform(&self.task, &input, &self.options).await
    }
}

#[async_trait]
impl RecoverableTask for TaskJob {
    fn task_id(&self) -> &str {
        &self.task.id
    }

    async fn retry(&self, simplified: bool) -> Result<(Value, f64), CrewError> {
        self.ledger.set_state(&self.task.id, TaskState::Running);
        let result = self.attempt(simplified).await;
        if result.is_err() {
            self.ledger.set_state(&self.task.id, TaskState::Recovering);
        }
        result
    }

    async fn cached_output(&self) -> Option<(Value, f64)> {
        let key = self.last_output_key.as_deref()?;
        match self.store.get_state(key).await {
            Ok(Some(raw)) => serde_json::from_value::<TaskOutput>(raw)
                .ok()
                .filter(|o| !o.degraded)
                .map(|o| (o.value, o.confidence)),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(task_id = %self.task.id, error = %e, "failed to read last good output");
                None
            }
        }
    }

    fn rule_based(&self) -> Option<Value> {
        self.task.fallback.as_ref().and_then(|f| f(&self.input))
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
