//! Crew 层错误类型
//!
//! 只有 Structural 与 Authentication 会同步抛给调用方；其余任务级错误交给恢复引擎，
//! 最终体现在 CrewResult.errors 中。

use std::time::Duration;

use thiserror::Error;

use crate::llm::InferenceError;
use crate::state::StoreError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CrewError {
    /// 环形依赖、缺失的 agent / tool 绑定、未知 crew 类型等，执行前即失败
    #[error("Structural error: {0}")]
    Structural(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Inference error: {0}")]
    Inference(InferenceError),

    #[error("Tool '{tool}' failed: {message}")]
    Tool { tool: String, message: String },

    /// 上游输出形状不符合契约
    #[error("Data quality error: {0}")]
    DataQuality(String),

    #[error("State store error: {0}")]
    State(String),

    #[error("Systemic fault: {0}")]
    Systemic(String),

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Wall-clock budget of {0:?} exceeded")]
    BudgetExceeded(Duration),
}

impl From<InferenceError> for CrewError {
    fn from(e: InferenceError) -> Self {
        match e {
            InferenceError::Authentication { status } => {
                CrewError::Authentication(format!("inference endpoint rejected credentials (status {status})"))
            }
            InferenceError::Cancelled => CrewError::Cancelled,
            other => CrewError::Inference(other),
        }
    }
}

impl From<StoreError> for CrewError {
    fn from(e: StoreError) -> Self {
        CrewError::State(e.to_string())
    }
}

impl CrewError {
    /// 是否应同步抛出而不进入恢复流程
    pub fn propagates(&self) -> bool {
        matches!(
            self,
            CrewError::Structural(_) | CrewError::Authentication(_) | CrewError::Cancelled
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            CrewError::Inference(e) => e.retry_after(),
            _ => None,
        }
    }
}
