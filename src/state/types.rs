//! 状态存储的数据类型：执行快照、检查点、记忆条目与错误

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::ExecutionContext;
use crate::crew::{ErrorRecord, TaskId, TaskOutput, TaskState};

pub type CheckpointId = String;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// 某次执行在检查点时刻的完整状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub execution_id: String,
    pub crew_type: String,
    pub context: ExecutionContext,
    pub inputs: Value,
    /// 按完成顺序
    pub completed_task_ids: Vec<TaskId>,
    pub task_states: BTreeMap<TaskId, TaskState>,
    pub task_outputs: BTreeMap<TaskId, TaskOutput>,
    pub error_log: Vec<ErrorRecord>,
}

impl ExecutionSnapshot {
    pub fn to_value(&self) -> Result<Value, StoreError> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: Value) -> Result<Self, StoreError> {
        Ok(serde_json::from_value(value)?)
    }

    /// 恢复执行时的初始状态：只有 succeeded 保留，其余（含 running）回到 pending
    pub fn resume_states(&self) -> BTreeMap<TaskId, TaskState> {
        self.task_states
            .iter()
            .map(|(id, state)| {
                let state = match state {
                    TaskState::Succeeded if self.task_outputs.contains_key(id) => TaskState::Succeeded,
                    _ => TaskState::Pending,
                };
                (id.clone(), state)
            })
            .collect()
    }
}

/// 不可变检查点；payload 为写入时的序列化文本，restore 按原样解析
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub execution_id: String,
    /// 同一执行内单调递增
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    pub payload: String,
}

impl Checkpoint {
    pub fn state(&self) -> Result<Value, StoreError> {
        Ok(serde_json::from_str(&self.payload)?)
    }
}

/// 记忆条目（仅作参考上下文）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

impl MemoryEntry {
    pub fn now(payload: Value) -> Self {
        Self {
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// 记忆保留方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRetention {
    /// 短期：只保留最近 N 条
    Recent(usize),
    /// 长期：按 TTL 过期
    Ttl(Duration),
}

pub(crate) fn expiry_after(ttl: Duration) -> DateTime<Utc> {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500));
    Utc::now() + ttl
}
