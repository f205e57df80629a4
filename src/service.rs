//! CrewService：对外接口
//!
//! - submit 异步提交，立即返回 execution_id；execute 同步执行并返回结果
//! - 同时运行的 crew 数受 max_concurrent_runs 限制，超出的提交进入 queued
//! - cancel / get_results 只对执行的发起者（user_id）生效
//! - 已结束的执行记录按保留时长清理

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::{CrewError, ExecutionContext, ExecutionSupervisor};
use crate::crew::{
    live_state_key, CrewDefinition, CrewExecutor, CrewRegistry, CrewResult, ExecutorSettings,
    RunControl, TaskId, TaskState,
};
use crate::llm::{ClientConfig, InferenceBackend, InferenceClient, ResponseCache, UsageMonitor};
use crate::recovery::{CircuitBreaker, RecoveryEngine};
use crate::state::{open_store, ExecutionSnapshot, StateStore};
use crate::tools::default_registry;

/// 执行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// 已登记，尚未申请运行槽位
    Pending,
    /// 等待运行槽位
    Queued,
    Running,
    /// 运行结束并产出结果（结果本身可能 success = false）
    Completed,
    /// 运行以错误结束（认证失败等）
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// 执行记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub crew_type: String,
    pub context: ExecutionContext,
    pub inputs: Value,
    pub status: ExecutionStatus,
    /// 毫秒时间戳
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub result: Option<CrewResult>,
    pub error: Option<String>,
    /// 第几次运行（resume 递增）；旧运行的迟到结果按它丢弃
    pub attempt: u32,
}

impl ExecutionRecord {
    fn new(execution_id: String, crew_type: &str, context: ExecutionContext, inputs: Value) -> Self {
        Self {
            execution_id,
            crew_type: crew_type.to_string(),
            context,
            inputs,
            status: ExecutionStatus::Pending,
            created_at: now_millis(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            attempt: 0,
        }
    }
}

/// 运行入口：新运行或从快照恢复
enum Launch {
    Fresh { ctx: ExecutionContext, inputs: Value },
    Resume(ExecutionSnapshot),
}

/// get_status 的返回
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub execution_id: String,
    pub crew_type: String,
    pub status: ExecutionStatus,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    /// 运行中状态（最近一次任务终态写入的快照）
    pub task_states: Option<Value>,
    pub completed_task_ids: Vec<TaskId>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub max_concurrent_runs: usize,
    pub retention: Duration,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for ServiceSettings {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            max_concurrent_runs: cfg.app.max_concurrent_runs.max(1),
            retention: Duration::from_secs(cfg.app.run_retention_hours.saturating_mul(3600)),
        }
    }
}

pub struct CrewService {
    executor: CrewExecutor,
    registry: CrewRegistry,
    supervisor: ExecutionSupervisor,
    records: RwLock<HashMap<String, ExecutionRecord>>,
    run_slots: Arc<Semaphore>,
    settings: ServiceSettings,
}

impl CrewService {
    pub fn new(executor: CrewExecutor, registry: CrewRegistry, settings: ServiceSettings) -> Self {
        Self {
            run_slots: Arc::new(Semaphore::new(settings.max_concurrent_runs.max(1))),
            executor,
            registry,
            supervisor: ExecutionSupervisor::new(),
            records: RwLock::new(HashMap::new()),
            settings,
        }
    }

    /// 按配置装配：推理客户端（缓存 / 熔断 / 用量）、状态存储、恢复引擎、默认工具
    pub async fn from_config(
        cfg: &AppConfig,
        backend: Arc<dyn InferenceBackend>,
        registry: CrewRegistry,
    ) -> Result<Self, CrewError> {
        let client = InferenceClient::new(backend, ClientConfig::from_app_config(cfg))
            .with_cache(Arc::new(ResponseCache::new(cfg.cache.strategy, cfg.cache.max_entries)))
            .with_breaker(Arc::new(CircuitBreaker::new(
                cfg.circuit_breaker.failure_threshold,
                Duration::from_secs(cfg.circuit_breaker.cooldown_secs),
            )))
            .with_usage_monitor(Arc::new(UsageMonitor::default()));
        let store = open_store(&cfg.state).await?;
        let executor = CrewExecutor::new(
            Arc::new(client),
            default_registry(),
            store,
            RecoveryEngine::from_config(&cfg.recovery),
            ExecutorSettings::from(cfg),
        );
        Ok(Self::new(executor, registry, ServiceSettings::from(cfg)))
    }

    pub fn executor(&self) -> &CrewExecutor {
        &self.executor
    }

    pub fn registry(&self) -> &CrewRegistry {
        &self.registry
    }

    fn store(&self) -> &Arc<dyn StateStore> {
        self.executor.store()
    }

    /// 实例化并校验定义，登记执行记录；结构性错误在此同步返回
    async fn prepare(
        &self,
        crew_type: &str,
        ctx: &ExecutionContext,
        inputs: &Value,
    ) -> Result<(String, CrewDefinition, CancellationToken), CrewError> {
        let def = self.registry.instantiate(crew_type, ctx, inputs)?;
        def.validate()?;

        let execution_id = format!("exec_{}", uuid::Uuid::new_v4());
        let token = self.supervisor.register(&execution_id);
        let record = ExecutionRecord::new(execution_id.clone(), crew_type, ctx.clone(), inputs.clone());
        self.records.write().await.insert(execution_id.clone(), record);

        tracing::info!(
            execution_id = %execution_id,
            crew_type,
            organization_id = %ctx.organization_id,
            correlation_id = %ctx.correlation_id,
            "execution registered"
        );
        Ok((execution_id, def, token))
    }

    /// 异步提交，返回 execution_id
    pub async fn submit(
        self: &Arc<Self>,
        crew_type: &str,
        ctx: ExecutionContext,
        inputs: Value,
    ) -> Result<String, CrewError> {
        let (execution_id, def, token) = self.prepare(crew_type, &ctx, &inputs).await?;
        let service = Arc::clone(self);
        let id = execution_id.clone();
        let crew_type = crew_type.to_string();
        tokio::spawn(async move {
            let launch = Launch::Fresh { ctx, inputs };
            if let Err(e) = service.run_execution(&id, 0, &crew_type, def, launch, token).await {
                tracing::debug!(execution_id = %id, error = %e, "background execution ended with error");
            }
        });
        Ok(execution_id)
    }

    /// 同步执行，返回 CrewResult
    pub async fn execute(
        &self,
        crew_type: &str,
        ctx: ExecutionContext,
        inputs: Value,
    ) -> Result<CrewResult, CrewError> {
        let (execution_id, def, token) = self.prepare(crew_type, &ctx, &inputs).await?;
        self.run_execution(&execution_id, 0, crew_type, def, Launch::Fresh { ctx, inputs }, token)
            .await
    }

    async fn acquire_slot(
        &self,
        execution_id: &str,
        token: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, CrewError> {
        if let Ok(permit) = self.run_slots.clone().try_acquire_owned() {
            return Ok(permit);
        }
        self.update(execution_id, |r| r.status = ExecutionStatus::Queued).await;
        tracing::info!(execution_id, "no free run slot, execution queued");
        tokio::select! {
            _ = token.cancelled() => Err(CrewError::Cancelled),
            permit = self.run_slots.clone().acquire_owned() => {
                permit.map_err(|_| CrewError::Cancelled)
            }
        }
    }

    async fn run_execution(
        &self,
        execution_id: &str,
        attempt: u32,
        crew_type: &str,
        def: CrewDefinition,
        launch: Launch,
        token: CancellationToken,
    ) -> Result<CrewResult, CrewError> {
        let permit = match self.acquire_slot(execution_id, &token).await {
            Ok(permit) => permit,
            Err(e) => {
                let result = Err(e);
                self.finish(execution_id, attempt, &result).await;
                return result;
            }
        };
        self.update(execution_id, |r| {
            r.status = ExecutionStatus::Running;
            r.started_at = Some(now_millis());
        })
        .await;

        let control = RunControl::new(execution_id).with_cancel(token);
        let result = match launch {
            Launch::Fresh { ctx, inputs } => self.executor.run(crew_type, &def, &ctx, inputs, control).await,
            Launch::Resume(snapshot) => self.executor.resume(&def, snapshot, control).await,
        };
        drop(permit);

        self.finish(execution_id, attempt, &result).await;
        result
    }

    /// 记录运行结果；已被取消的执行或已被 resume 取代的运行不会覆盖记录
    async fn finish(&self, execution_id: &str, attempt: u32, result: &Result<CrewResult, CrewError>) {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(execution_id) else {
            return;
        };
        if record.attempt != attempt {
            tracing::debug!(execution_id, attempt, current = record.attempt, "stale run finished");
            return;
        }
        self.supervisor.release(execution_id);
        if record.status == ExecutionStatus::Cancelled {
            tracing::info!(execution_id, "execution finished after cancellation, result discarded");
            return;
        }
        record.completed_at = Some(now_millis());
        match result {
            Ok(result) => {
                record.status = ExecutionStatus::Completed;
                record.result = Some(result.clone());
            }
            Err(CrewError::Cancelled) => record.status = ExecutionStatus::Cancelled,
            Err(e) => {
                tracing::warn!(execution_id, error = %e, "execution failed");
                record.status = ExecutionStatus::Failed;
                record.error = Some(e.to_string());
            }
        }
    }

    async fn update<F>(&self, execution_id: &str, f: F)
    where
        F: FnOnce(&mut ExecutionRecord),
    {
        if let Some(record) = self.records.write().await.get_mut(execution_id) {
            f(record);
        }
    }

    pub async fn get_status(&self, execution_id: &str) -> Option<StatusReport> {
        let record = self.records.read().await.get(execution_id).cloned()?;
        let live = match self.store().get_state(&live_state_key(execution_id)).await {
            Ok(live) => live.and_then(|v| ExecutionSnapshot::from_value(v).ok()),
            Err(e) => {
                tracing::warn!(execution_id, error = %e, "failed to read live state");
                None
            }
        };
        Some(StatusReport {
            execution_id: record.execution_id,
            crew_type: record.crew_type,
            status: record.status,
            created_at: record.created_at,
            started_at: record.started_at,
            completed_at: record.completed_at,
            task_states: live.as_ref().map(|s| json!(s.task_states)),
            completed_task_ids: live.map(|s| s.completed_task_ids).unwrap_or_default(),
            error: record.error,
        })
    }

    /// 取消执行：只有发起者可以取消，且仅限尚未结束的执行
    pub async fn cancel(&self, execution_id: &str, requester_id: &str) -> bool {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(execution_id) else {
            return false;
        };
        if record.context.user_id != requester_id {
            tracing::warn!(execution_id, requester_id, "cancel rejected: requester does not own execution");
            return false;
        }
        if record.status.is_terminal() {
            return false;
        }
        self.supervisor.cancel(execution_id);
        record.status = ExecutionStatus::Cancelled;
        record.completed_at = Some(now_millis());
        tracing::info!(execution_id, "execution cancelled");
        true
    }

    /// 查询结果；非发起者或尚未结束时返回 None
    ///
    /// 取消或失败的执行由最后一个检查点构造结果，进行中任务的输出不会出现。
    pub async fn get_results(
        &self,
        execution_id: &str,
        requester_id: &str,
    ) -> Result<Option<CrewResult>, CrewError> {
        let Some(record) = self.records.read().await.get(execution_id).cloned() else {
            return Ok(None);
        };
        if record.context.user_id != requester_id || !record.status.is_terminal() {
            return Ok(None);
        }
        if let Some(result) = record.result.filter(|_| record.status == ExecutionStatus::Completed) {
            return Ok(Some(result));
        }

        let mut metadata = Map::new();
        metadata.insert("execution_id".into(), json!(execution_id));
        metadata.insert("crew_type".into(), json!(record.crew_type));
        metadata.insert("status".into(), json!(record.status));
        if let Some(error) = &record.error {
            metadata.insert("error".into(), json!(error));
        }
        let result = match self.store().latest_checkpoint(execution_id).await? {
            Some(checkpoint) => {
                let snapshot = ExecutionSnapshot::from_value(checkpoint.state()?)?;
                metadata.insert("checkpoint_id".into(), json!(checkpoint.id));
                CrewResult::from_snapshot(&snapshot, metadata)
            }
            None => CrewResult::empty(metadata),
        };
        Ok(Some(result))
    }

    /// 从最后一个检查点恢复已取消或失败的执行；已成功的任务直接复用
    pub async fn resume(&self, execution_id: &str, requester_id: &str) -> Result<CrewResult, CrewError> {
        let record = self
            .records
            .read()
            .await
            .get(execution_id)
            .cloned()
            .ok_or_else(|| CrewError::Structural(format!("unknown execution '{execution_id}'")))?;
        if record.context.user_id != requester_id {
            return Err(CrewError::Authentication(format!(
                "requester '{requester_id}' does not own execution '{execution_id}'"
            )));
        }
        if !matches!(record.status, ExecutionStatus::Cancelled | ExecutionStatus::Failed) {
            return Err(CrewError::Structural(format!(
                "execution '{execution_id}' is {:?} and cannot be resumed",
                record.status
            )));
        }

        let def = self
            .registry
            .instantiate(&record.crew_type, &record.context, &record.inputs)?;
        let snapshot = match self.store().latest_checkpoint(execution_id).await? {
            Some(checkpoint) => ExecutionSnapshot::from_value(checkpoint.state()?)?,
            None => ExecutionSnapshot {
                execution_id: execution_id.to_string(),
                crew_type: record.crew_type.clone(),
                context: record.context.clone(),
                inputs: record.inputs.clone(),
                completed_task_ids: Vec::new(),
                task_states: def
                    .tasks
                    .iter()
                    .map(|t| (t.id.clone(), TaskState::Pending))
                    .collect(),
                task_outputs: Default::default(),
                error_log: Vec::new(),
            },
        };

        // 状态在写锁内复查，并发的 resume 只有一个生效
        let (attempt, token) = {
            let mut records = self.records.write().await;
            let Some(r) = records.get_mut(execution_id) else {
                return Err(CrewError::Structural(format!("unknown execution '{execution_id}'")));
            };
            if !matches!(r.status, ExecutionStatus::Cancelled | ExecutionStatus::Failed) {
                return Err(CrewError::Structural(format!(
                    "execution '{execution_id}' is already being resumed"
                )));
            }
            r.attempt += 1;
            r.status = ExecutionStatus::Pending;
            r.started_at = None;
            r.completed_at = None;
            r.error = None;
            r.result = None;
            (r.attempt, self.supervisor.register(execution_id))
        };
        tracing::info!(execution_id, attempt, "resuming execution");

        self.run_execution(execution_id, attempt, &record.crew_type, def, Launch::Resume(snapshot), token)
            .await
    }

    /// 清理超过保留时长的已结束记录，并清除存储中过期的状态与检查点
    pub async fn cleanup_finished(&self, max_age: Duration) -> usize {
        let cutoff = now_millis() - i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
        let removed = {
            let mut records = self.records.write().await;
            let before = records.len();
            records.retain(|_, r| !(r.status.is_terminal() && r.completed_at.is_some_and(|t| t < cutoff)));
            before - records.len()
        };
        match self.store().purge_expired().await {
            Ok(purged) if purged > 0 => tracing::info!(purged, "purged expired state entries"),
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "failed to purge expired state"),
        }
        if removed > 0 {
            tracing::info!(removed, "cleaned up finished executions");
        }
        removed
    }

    /// 按配置的保留时长清理
    pub async fn cleanup_expired(&self) -> usize {
        self.cleanup_finished(self.settings.retention).await
    }

    /// 取消所有运行并拒绝新的运行槽位申请
    pub fn shutdown(&self) {
        tracing::info!("crew service shutting down");
        self.supervisor.shutdown();
        self.run_slots.close();
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crew::{AgentSpec, TaskSpec};
    use crate::llm::MockBackend;
    use crate::state::InMemoryStateStore;

    fn service(backend: MockBackend) -> Arc<CrewService> {
        let client = InferenceClient::new(Arc::new(backend), ClientConfig::default());
        let executor = CrewExecutor::new(
            Arc::new(client),
            default_registry(),
            Arc::new(InMemoryStateStore::default()),
            RecoveryEngine::default(),
            ExecutorSettings::default(),
        );
        let mut registry = CrewRegistry::new();
        registry.register_definition(
            "echo",
            CrewDefinition::builder("echo")
                .agent(AgentSpec::new("writer", "Writer", "write"))
                .task(TaskSpec::new("draft", "Write a draft", "writer"))
                .build()
                .unwrap(),
        );
        Arc::new(CrewService::new(executor, registry, ServiceSettings::default()))
    }

    #[tokio::test]
    async fn test_execute_records_completion() {
        let backend = MockBackend::new();
        backend.push_text("a draft");
        let svc = service(backend);
        let ctx = ExecutionContext::new("org", "alice");

        let result = svc.execute("echo", ctx, json!({})).await.unwrap();
        assert!(result.success);
        assert_eq!(result.results["draft"], json!("a draft"));

        let id = result.metadata["execution_id"].as_str().unwrap().to_string();
        let status = svc.get_status(&id).await.unwrap();
        assert_eq!(status.status, ExecutionStatus::Completed);
        assert_eq!(status.completed_task_ids, vec!["draft"]);
        assert_eq!(svc.get_results(&id, "alice").await.unwrap(), Some(result));
        assert_eq!(svc.get_results(&id, "mallory").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unknown_crew_type_fails_synchronously() {
        let svc = service(MockBackend::new());
        let err = svc
            .submit("missing", ExecutionContext::new("org", "alice"), json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, CrewError::Structural(_)));
    }

    #[tokio::test]
    async fn test_cleanup_removes_finished_records() {
        let backend = MockBackend::new();
        backend.push_text("done");
        let svc = service(backend);
        let result = svc
            .execute("echo", ExecutionContext::new("org", "alice"), json!({}))
            .await
            .unwrap();
        let id = result.metadata["execution_id"].as_str().unwrap().to_string();

        assert_eq!(svc.cleanup_finished(Duration::from_secs(3600)).await, 0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(svc.cleanup_finished(Duration::ZERO).await, 1);
        assert!(svc.get_status(&id).await.is_none());
    }
}
