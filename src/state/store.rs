//! 状态存储接口
//!
//! 检查点只追加不修改；restore 幂等，多次调用得到相同内容。

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::{Checkpoint, CheckpointId, MemoryEntry, MemoryRetention, StoreError};

#[async_trait]
pub trait StateStore: Send + Sync {
    /// 写入带 TTL 的运行中状态
    async fn save_state(&self, key: &str, state: &Value, ttl: Duration) -> Result<(), StoreError>;

    async fn get_state(&self, key: &str) -> Result<Option<Value>, StoreError>;

    async fn delete_state(&self, key: &str) -> Result<bool, StoreError>;

    async fn create_checkpoint(&self, execution_id: &str, state: &Value) -> Result<CheckpointId, StoreError>;

    /// 最新的在前
    async fn list_checkpoints(&self, execution_id: &str, limit: usize) -> Result<Vec<Checkpoint>, StoreError>;

    async fn restore(&self, checkpoint_id: &str) -> Result<Option<Value>, StoreError>;

    async fn append_memory(
        &self,
        scope: &str,
        entry: MemoryEntry,
        retention: MemoryRetention,
    ) -> Result<(), StoreError>;

    /// 按时间顺序返回最近 limit 条未过期记忆
    async fn recent_memory(&self, scope: &str, limit: usize) -> Result<Vec<MemoryEntry>, StoreError>;

    /// 清理过期状态、检查点与记忆，返回清理数量
    async fn purge_expired(&self) -> Result<usize, StoreError>;

    async fn latest_checkpoint(&self, execution_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        Ok(self.list_checkpoints(execution_id, 1).await?.into_iter().next())
    }
}
