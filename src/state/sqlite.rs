//! SQLite 状态存储
//!
//! 运行中状态、检查点与记忆分三张表保存，服务重启后可从检查点恢复执行。

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use super::types::expiry_after;
use super::{Checkpoint, CheckpointId, MemoryEntry, MemoryRetention, StateStore, StoreError};

pub struct SqliteStateStore {
    pool: SqlitePool,
    checkpoint_ttl: Duration,
}

impl SqliteStateStore {
    /// 打开（必要时创建）数据库文件
    pub async fn open(db_path: impl AsRef<Path>, checkpoint_ttl: Duration) -> Result<Self, StoreError> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;
        let store = Self { pool, checkpoint_ttl };
        store.init_tables().await?;
        tracing::info!(path = %db_path.display(), "sqlite state store ready");
        Ok(store)
    }

    /// 单连接内存库，连接不回收
    pub async fn in_memory(checkpoint_ttl: Duration) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool, checkpoint_ttl };
        store.init_tables().await?;
        Ok(store)
    }

    async fn init_tables(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS crew_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS crew_checkpoints (
                id TEXT PRIMARY KEY,
                execution_id TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                payload TEXT NOT NULL,
                UNIQUE (execution_id, sequence)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS crew_memory (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                scope TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at INTEGER,
                payload TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_crew_memory_scope ON crew_memory(scope, id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn save_state(&self, key: &str, state: &Value, ttl: Duration) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO crew_state (key, value, expires_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
        )
        .bind(key)
        .bind(serde_json::to_string(state)?)
        .bind(expiry_after(ttl).timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_state(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let row = sqlx::query("SELECT value FROM crew_state WHERE key = ? AND expires_at > ?")
            .bind(key)
            .bind(now_millis())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let raw: String = row.try_get("value")?;
                Ok(Some(serde_json::from_str(&raw)?))
            }
            None => Ok(None),
        }
    }

    async fn delete_state(&self, key: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM crew_state WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn create_checkpoint(&self, execution_id: &str, state: &Value) -> Result<CheckpointId, StoreError> {
        let payload = serde_json::to_string(state)?;
        let id = format!("ckpt_{}", uuid::Uuid::new_v4());

        let mut tx = self.pool.begin().await?;
        let sequence: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(sequence), 0) + 1 FROM crew_checkpoints WHERE execution_id = ?",
        )
        .bind(execution_id)
        .fetch_one(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO crew_checkpoints (id, execution_id, sequence, created_at, expires_at, payload)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(execution_id)
        .bind(sequence)
        .bind(Utc::now())
        .bind(expiry_after(self.checkpoint_ttl).timestamp_millis())
        .bind(&payload)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        tracing::debug!(execution_id, checkpoint_id = %id, sequence, "checkpoint created");
        Ok(id)
    }

    async fn list_checkpoints(&self, execution_id: &str, limit: usize) -> Result<Vec<Checkpoint>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, execution_id, sequence, created_at, payload FROM crew_checkpoints
             WHERE execution_id = ? AND expires_at > ?
             ORDER BY sequence DESC LIMIT ?",
        )
        .bind(execution_id)
        .bind(now_millis())
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<Checkpoint, StoreError> {
                let sequence: i64 = row.try_get("sequence")?;
                let created_at: DateTime<Utc> = row.try_get("created_at")?;
                Ok(Checkpoint {
                    id: row.try_get("id")?,
                    execution_id: row.try_get("execution_id")?,
                    sequence: sequence.max(0) as u64,
                    created_at,
                    payload: row.try_get("payload")?,
                })
            })
            .collect()
    }

    async fn restore(&self, checkpoint_id: &str) -> Result<Option<Value>, StoreError> {
        let payload: Option<String> = sqlx::query_scalar(
            "SELECT payload FROM crew_checkpoints WHERE id = ? AND expires_at > ?",
        )
        .bind(checkpoint_id)
        .bind(now_millis())
        .fetch_optional(&self.pool)
        .await?;
        match payload {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn append_memory(
        &self,
        scope: &str,
        entry: MemoryEntry,
        retention: MemoryRetention,
    ) -> Result<(), StoreError> {
        let expires_at = match retention {
            MemoryRetention::Ttl(ttl) => Some(expiry_after(ttl).timestamp_millis()),
            MemoryRetention::Recent(_) => None,
        };
        sqlx::query("INSERT INTO crew_memory (scope, created_at, expires_at, payload) VALUES (?, ?, ?, ?)")
            .bind(scope)
            .bind(entry.timestamp)
            .bind(expires_at)
            .bind(serde_json::to_string(&entry.payload)?)
            .execute(&self.pool)
            .await?;

        if let MemoryRetention::Recent(keep) = retention {
            sqlx::query(
                "DELETE FROM crew_memory WHERE scope = ? AND id NOT IN (
                    SELECT id FROM crew_memory WHERE scope = ? ORDER BY id DESC LIMIT ?
                )",
            )
            .bind(scope)
            .bind(scope)
            .bind(keep.min(i64::MAX as usize) as i64)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn recent_memory(&self, scope: &str, limit: usize) -> Result<Vec<MemoryEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT created_at, payload FROM crew_memory
             WHERE scope = ? AND (expires_at IS NULL OR expires_at > ?)
             ORDER BY id DESC LIMIT ?",
        )
        .bind(scope)
        .bind(now_millis())
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut entries = rows
            .into_iter()
            .map(|row| -> Result<MemoryEntry, StoreError> {
                let raw: String = row.try_get("payload")?;
                Ok(MemoryEntry {
                    timestamp: row.try_get("created_at")?,
                    payload: serde_json::from_str(&raw)?,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        entries.reverse();
        Ok(entries)
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = now_millis();
        let mut purged = 0u64;
        for sql in [
            "DELETE FROM crew_state WHERE expires_at <= ?",
            "DELETE FROM crew_checkpoints WHERE expires_at <= ?",
            "DELETE FROM crew_memory WHERE expires_at IS NOT NULL AND expires_at <= ?",
        ] {
            purged += sqlx::query(sql).bind(now).execute(&self.pool).await?.rows_affected();
        }
        if purged > 0 {
            tracing::info!(purged, "purged expired state entries");
        }
        Ok(purged as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_checkpoints_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("crew.db");
        let ttl = Duration::from_secs(86_400);

        let state = json!({"task_states": {"a": "succeeded"}, "confidence": 0.8125});
        let id = {
            let store = SqliteStateStore::open(&path, ttl).await.unwrap();
            store.create_checkpoint("exec-1", &json!({"first": true})).await.unwrap();
            store.create_checkpoint("exec-1", &state).await.unwrap()
        };

        let store = SqliteStateStore::open(&path, ttl).await.unwrap();
        let list = store.list_checkpoints("exec-1", 5).await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, id);
        assert_eq!(list[0].sequence, 2);
        assert_eq!(list[0].state().unwrap(), state);
        assert_eq!(store.restore(&id).await.unwrap(), Some(state.clone()));
        assert_eq!(store.restore(&id).await.unwrap(), Some(state));
    }

    #[tokio::test]
    async fn test_state_upsert_and_expiry() {
        let store = SqliteStateStore::in_memory(Duration::from_secs(86_400)).await.unwrap();
        store.save_state("k", &json!(1), Duration::from_secs(60)).await.unwrap();
        store.save_state("k", &json!(2), Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.get_state("k").await.unwrap(), Some(json!(2)));

        store.save_state("old", &json!(0), Duration::ZERO).await.unwrap();
        assert_eq!(store.get_state("old").await.unwrap(), None);
        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert!(store.delete_state("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_retention() {
        let store = SqliteStateStore::in_memory(Duration::from_secs(86_400)).await.unwrap();
        for i in 0..4 {
            store
                .append_memory("s", MemoryEntry::now(json!(i)), MemoryRetention::Recent(2))
                .await
                .unwrap();
        }
        let entries = store.recent_memory("s", 10).await.unwrap();
        let payloads: Vec<Value> = entries.into_iter().map(|e| e.payload).collect();
        assert_eq!(payloads, vec![json!(2), json!(3)]);

        store
            .append_memory("long", MemoryEntry::now(json!("kept")), MemoryRetention::Ttl(Duration::from_secs(3600)))
            .await
            .unwrap();
        assert_eq!(store.recent_memory("long", 1).await.unwrap().len(), 1);
    }
}
