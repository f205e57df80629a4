//! 进程内状态存储（默认后端，测试与单机运行使用）

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::types::expiry_after;
use super::{Checkpoint, CheckpointId, MemoryEntry, MemoryRetention, StateStore, StoreError};

struct StoredCheckpoint {
    checkpoint: Checkpoint,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    states: HashMap<String, (Value, DateTime<Utc>)>,
    checkpoints: HashMap<CheckpointId, StoredCheckpoint>,
    /// execution_id → 按 sequence 递增的检查点 id
    by_execution: HashMap<String, Vec<CheckpointId>>,
    memory: HashMap<String, VecDeque<(MemoryEntry, Option<DateTime<Utc>>)>>,
}

pub struct InMemoryStateStore {
    inner: RwLock<Inner>,
    checkpoint_ttl: Duration,
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(86_400))
    }
}

impl InMemoryStateStore {
    pub fn new(checkpoint_ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            checkpoint_ttl,
        }
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn save_state(&self, key: &str, state: &Value, ttl: Duration) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner
            .states
            .insert(key.to_string(), (state.clone(), expiry_after(ttl)));
        Ok(())
    }

    async fn get_state(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();
        Ok(inner
            .states
            .get(key)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(v, _)| v.clone()))
    }

    async fn delete_state(&self, key: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        Ok(inner.states.remove(key).is_some())
    }

    async fn create_checkpoint(&self, execution_id: &str, state: &Value) -> Result<CheckpointId, StoreError> {
        let payload = serde_json::to_string(state)?;
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let sequence = inner
            .by_execution
            .get(execution_id)
            .and_then(|ids| ids.last())
            .and_then(|id| inner.checkpoints.get(id))
            .map(|c| c.checkpoint.sequence + 1)
            .unwrap_or(1);
        let id = format!("ckpt_{}", uuid::Uuid::new_v4());
        let checkpoint = Checkpoint {
            id: id.clone(),
            execution_id: execution_id.to_string(),
            sequence,
            created_at: Utc::now(),
            payload,
        };
        inner.checkpoints.insert(
            id.clone(),
            StoredCheckpoint {
                checkpoint,
                expires_at: expiry_after(self.checkpoint_ttl),
            },
        );
        inner
            .by_execution
            .entry(execution_id.to_string())
            .or_default()
            .push(id.clone());
        tracing::debug!(execution_id, checkpoint_id = %id, sequence, "checkpoint created");
        Ok(id)
    }

    async fn list_checkpoints(&self, execution_id: &str, limit: usize) -> Result<Vec<Checkpoint>, StoreError> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();
        let Some(ids) = inner.by_execution.get(execution_id) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .rev()
            .filter_map(|id| inner.checkpoints.get(id))
            .filter(|c| c.expires_at > now)
            .take(limit)
            .map(|c| c.checkpoint.clone())
            .collect())
    }

    async fn restore(&self, checkpoint_id: &str) -> Result<Option<Value>, StoreError> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();
        match inner.checkpoints.get(checkpoint_id) {
            Some(c) if c.expires_at > now => Ok(Some(c.checkpoint.state()?)),
            _ => Ok(None),
        }
    }

    async fn append_memory(
        &self,
        scope: &str,
        entry: MemoryEntry,
        retention: MemoryRetention,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let entries = inner.memory.entry(scope.to_string()).or_default();
        match retention {
            MemoryRetention::Recent(keep) => {
                entries.push_back((entry, None));
                while entries.len() > keep {
                    entries.pop_front();
                }
            }
            MemoryRetention::Ttl(ttl) => entries.push_back((entry, Some(expiry_after(ttl)))),
        }
        Ok(())
    }

    async fn recent_memory(&self, scope: &str, limit: usize) -> Result<Vec<MemoryEntry>, StoreError> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();
        let Some(entries) = inner.memory.get(scope) else {
            return Ok(Vec::new());
        };
        let mut recent: Vec<MemoryEntry> = entries
            .iter()
            .rev()
            .filter(|(_, expires_at)| expires_at.map_or(true, |t| t > now))
            .take(limit)
            .map(|(e, _)| e.clone())
            .collect();
        recent.reverse();
        Ok(recent)
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();
        let mut purged = 0;

        let before = inner.states.len();
        inner.states.retain(|_, (_, expires_at)| *expires_at > now);
        purged += before - inner.states.len();

        let before = inner.checkpoints.len();
        inner.checkpoints.retain(|_, c| c.expires_at > now);
        purged += before - inner.checkpoints.len();
        let Inner {
            checkpoints,
            by_execution,
            ..
        } = &mut *inner;
        for ids in by_execution.values_mut() {
            ids.retain(|id| checkpoints.contains_key(id));
        }
        by_execution.retain(|_, ids| !ids.is_empty());

        for entries in inner.memory.values_mut() {
            let before = entries.len();
            entries.retain(|(_, expires_at)| expires_at.map_or(true, |t| t > now));
            purged += before - entries.len();
        }
        Ok(purged)
    }
}
