//! 状态与检查点存储
//!
//! - 运行中状态：带 TTL 的键值
//! - 检查点：按执行 id 追加，不可修改，可按 id 恢复
//! - 记忆：短期（最近 N 条）与长期（TTL）两种保留方式

pub mod memory;
pub mod sqlite;
pub mod store;
pub mod types;

use std::sync::Arc;

pub use memory::InMemoryStateStore;
pub use sqlite::SqliteStateStore;
pub use store::StateStore;
pub use types::{
    Checkpoint, CheckpointId, ExecutionSnapshot, MemoryEntry, MemoryRetention, StoreError,
};

use crate::config::StateSection;

/// 按配置打开状态存储后端
pub async fn open_store(section: &StateSection) -> Result<Arc<dyn StateStore>, StoreError> {
    match section.backend.as_str() {
        "sqlite" => Ok(Arc::new(
            SqliteStateStore::open(&section.sqlite_path, section.checkpoint_ttl()).await?,
        )),
        other => {
            if other != "memory" {
                tracing::warn!(backend = other, "unknown state backend, using in-memory store");
            }
            Ok(Arc::new(InMemoryStateStore::new(section.checkpoint_ttl())))
        }
    }
}
