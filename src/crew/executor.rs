//! Crew 执行器
//!
//! 流程：校验定义并解析依赖图 → 实例化 agent（绑定工具、限流、记忆）→ 按执行方式分阶段执行 →
//! 每个任务进入 succeeded / failed 终态后写检查点 → 组装 CrewResult。
//!
//! - sequential：按拓扑序逐个执行，遇到 terminate、未恢复的失败或降级输出即提前结束
//! - parallel：就绪任务按提交顺序进入 worker 池（上限 max_workers），失败只影响其下游
//! - hierarchical：manager 任务先给出分阶段计划，每阶段结束后复核剩余阶段
//!
//! 取消在任意挂起点生效：进行中的任务被直接丢弃，最后一个检查点保持为持久记录。
//! 超出时间预算时未完成的任务被跳过，结果标记为降级。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::{CrewError, ExecutionContext};
use crate::crew::agent::{Agent, InvocationOptions};
use crate::crew::job::TaskJob;
use crate::crew::ledger::{Ledger, TaskOutcome};
use crate::crew::{
    CrewDefinition, CrewResult, ErrorRecord, OutputContract, Process, SkipReason, TaskGraph, TaskId,
    TaskInput, TaskSpec, TaskState,
};
use crate::llm::{InferenceClient, RateLimiter};
use crate::recovery::{ErrorClassifier, RecoveryEngine, RecoveryStrategy};
use crate::state::{ExecutionSnapshot, StateStore};
use crate::tools::{ToolExecutor, ToolRegistry, DEFAULT_TOOL_TIMEOUT};

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub max_agent_iterations: usize,
    /// 运行中状态的 TTL
    pub state_ttl: Duration,
    pub short_term_entries: usize,
    pub tool_timeout: Duration,
    /// hierarchical 模式下每阶段后是否请 manager 复核
    pub review_phases: bool,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for ExecutorSettings {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            max_agent_iterations: cfg.crew.max_agent_iterations,
            state_ttl: cfg.state.state_ttl(),
            short_term_entries: cfg.state.short_term_entries,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            review_phases: cfg.crew.review_phases,
        }
    }
}

/// 单次运行的控制句柄
#[derive(Debug, Clone)]
pub struct RunControl {
    pub execution_id: String,
    pub cancel: CancellationToken,
}

impl RunControl {
    pub fn new(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// 运行中状态的存储键
pub fn live_state_key(execution_id: &str) -> String {
    format!("execution:{execution_id}")
}

/// 实例化后的 crew：定义 + 依赖图 + agent
struct Crew {
    def: CrewDefinition,
    graph: TaskGraph,
    agents: HashMap<String, Arc<Agent>>,
    options: InvocationOptions,
    output_scope: Option<String>,
}

#[derive(Clone)]
struct Run {
    crew: Arc<Crew>,
    ledger: Arc<Ledger>,
    execution_id: String,
    crew_type: String,
    deadline: Instant,
}

/// 上下文注入方式
#[derive(Clone, Copy)]
enum ContextMode {
    /// 全部已完成任务的输出（sequential）
    Accumulated,
    /// 仅声明的上游任务
    Dependencies,
}

pub struct CrewExecutor {
    client: Arc<InferenceClient>,
    tools: ToolRegistry,
    store: Arc<dyn StateStore>,
    recovery: RecoveryEngine,
    settings: ExecutorSettings,
}

impl CrewExecutor {
    pub fn new(
        client: Arc<InferenceClient>,
        tools: ToolRegistry,
        store: Arc<dyn StateStore>,
        recovery: RecoveryEngine,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            client,
            tools,
            store,
            recovery,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn client(&self) -> &Arc<InferenceClient> {
        &self.client
    }

    /// 执行一次 crew 运行
    ///
    /// 任务级失败体现在结果中；只有结构性错误、认证失败与取消以 Err 返回。
    pub async fn run(
        &self,
        crew_type: &str,
        def: &CrewDefinition,
        ctx: &ExecutionContext,
        inputs: Value,
        control: RunControl,
    ) -> Result<CrewResult, CrewError> {
        let snapshot = ExecutionSnapshot {
            execution_id: control.execution_id.clone(),
            crew_type: crew_type.to_string(),
            context: ctx.clone(),
            inputs,
            completed_task_ids: Vec::new(),
            task_states: def
                .tasks
                .iter()
                .map(|t| (t.id.clone(), TaskState::Pending))
                .collect(),
            task_outputs: Default::default(),
            error_log: Vec::new(),
        };
        self.drive(def, snapshot, control).await
    }

    /// 从检查点快照恢复：已成功任务的输出原样复用，其余任务从头执行
    pub async fn resume(
        &self,
        def: &CrewDefinition,
        snapshot: ExecutionSnapshot,
        control: RunControl,
    ) -> Result<CrewResult, CrewError> {
        let mut snapshot = snapshot;
        let mut states = snapshot.resume_states();
        states.retain(|id, _| def.task(id).is_some());
        for task in &def.tasks {
            states.entry(task.id.clone()).or_insert(TaskState::Pending);
        }
        snapshot
            .task_outputs
            .retain(|id, _| states.get(id) == Some(&TaskState::Succeeded));
        snapshot
            .completed_task_ids
            .retain(|id| states.get(id) == Some(&TaskState::Succeeded));
        snapshot.task_states = states;
        snapshot.execution_id = control.execution_id.clone();

        tracing::info!(
            execution_id = %control.execution_id,
            reused = snapshot.completed_task_ids.len(),
            "resuming crew from checkpoint"
        );
        self.drive(def, snapshot, control).await
    }

    async fn drive(
        &self,
        def: &CrewDefinition,
        snapshot: ExecutionSnapshot,
        control: RunControl,
    ) -> Result<CrewResult, CrewError> {
        let started = Instant::now();
        let crew = self.instantiate(def, &snapshot.context, &snapshot.crew_type)?;
        let budget = def.config.wall_clock_budget();
        let run = Run {
            crew: Arc::new(crew),
            execution_id: control.execution_id.clone(),
            crew_type: snapshot.crew_type.clone(),
            ledger: Arc::new(Ledger::new(snapshot)),
            deadline: started + budget,
        };

        tracing::info!(
            execution_id = %run.execution_id,
            crew = %def.name,
            process = ?def.process,
            tasks = def.tasks.len(),
            "crew run started"
        );

        let outcome = tokio::select! {
            biased;
            _ = control.cancel.cancelled() => Err(CrewError::Cancelled),
            r = tokio::time::timeout_at(run.deadline, self.dispatch(&run)) => {
                r.unwrap_or(Err(CrewError::BudgetExceeded(budget)))
            }
        };

        let budget_exceeded = match outcome {
            Ok(()) => false,
            Err(CrewError::BudgetExceeded(budget)) => {
                let skipped = run.ledger.skip_unfinished(SkipReason::BudgetExceeded);
                let error = CrewError::BudgetExceeded(budget);
                tracing::warn!(execution_id = %run.execution_id, skipped = skipped.len(), "wall-clock budget exceeded");
                run.ledger.push_error(
                    ErrorRecord::new(None, &ErrorClassifier::classify(&error), error.to_string())
                        .recovered_by(RecoveryStrategy::DegradedService),
                );
                true
            }
            Err(e) => {
                tracing::warn!(execution_id = %run.execution_id, error = %e, "crew run aborted");
                return Err(e);
            }
        };

        let snapshot = run.ledger.snapshot();
        self.save_live(&snapshot).await;

        let mut metadata = Map::new();
        metadata.insert("execution_id".into(), json!(run.execution_id));
        metadata.insert("crew_type".into(), json!(run.crew_type));
        metadata.insert("crew".into(), json!(def.name));
        metadata.insert("process".into(), json!(def.process));
        metadata.insert("organization_id".into(), json!(snapshot.context.organization_id));
        metadata.insert("correlation_id".into(), json!(snapshot.context.correlation_id));
        metadata.insert("duration_ms".into(), json!(started.elapsed().as_millis() as u64));

        let result = CrewResult::assemble(
            &def.tasks,
            &snapshot.task_states,
            &snapshot.task_outputs,
            &run.ledger.skip_reasons(),
            snapshot.error_log,
            budget_exceeded,
            metadata,
        );
        tracing::info!(
            execution_id = %run.execution_id,
            success = result.success,
            confidence = result.confidence,
            errors = result.errors.len(),
            "crew run finished"
        );
        Ok(result)
    }

    fn instantiate(
        &self,
        def: &CrewDefinition,
        ctx: &ExecutionContext,
        crew_type: &str,
    ) -> Result<Crew, CrewError> {
        let graph = def.validate()?;
        let limiter = Arc::new(RateLimiter::per_minute(def.config.max_rpm));
        let scope = ctx.cache_scope(def.config.share_across_orgs);
        let tenant = scope.as_deref().unwrap_or("shared");

        let mut agents = HashMap::with_capacity(def.agents.len());
        for spec in &def.agents {
            let tools = self.tools.subset(&spec.tools).map_err(|missing| {
                CrewError::Structural(format!(
                    "agent '{}' declares unregistered tool '{missing}'",
                    spec.name
                ))
            })?;
            let mut agent = Agent::new(
                spec.clone(),
                self.client.clone(),
                ToolExecutor::new(tools, self.settings.tool_timeout),
                limiter.clone(),
                self.settings.max_agent_iterations,
            );
            if def.config.memory {
                agent = agent.with_memory(
                    self.store.clone(),
                    // 按 (租户, crew 类型, agent) 复用，条数上限封顶
                    format!("memory:{tenant}:{crew_type}:{}", spec.name),
                    self.settings.short_term_entries,
                );
            }
            agents.insert(spec.name.clone(), Arc::new(agent));
        }

        let output_scope = def
            .config
            .cache
            .then(|| format!("last_output:{tenant}:{crew_type}"));
        Ok(Crew {
            def: def.clone(),
            graph,
            agents,
            options: InvocationOptions {
                context_id: scope,
                cache: def.config.cache,
                cache_strategy: def.config.cache_strategy,
                rate_scope: ctx.rate_scope(),
            },
            output_scope,
        })
    }

    async fn dispatch(&self, run: &Run) -> Result<(), CrewError> {
        match run.crew.def.process {
            Process::Sequential => self.run_sequential(run).await,
            Process::Parallel => {
                let ready = self.initially_ready(run);
                self.run_pool(run, ready, true).await
            }
            Process::Hierarchical => self.run_hierarchical(run).await,
        }
    }

    fn check_deadline(&self, run: &Run) -> Result<(), CrewError> {
        if Instant::now() >= run.deadline {
            Err(CrewError::BudgetExceeded(run.crew.def.config.wall_clock_budget()))
        } else {
            Ok(())
        }
    }

    fn job(&self, run: &Run, id: &str, mode: ContextMode) -> Result<TaskJob, CrewError> {
        let crew = &run.crew;
        let task = crew
            .def
            .task(id)
            .cloned()
            .ok_or_else(|| CrewError::Structural(format!("unknown task '{id}'")))?;
        let agent = crew
            .agents
            .get(&task.agent)
            .cloned()
            .ok_or_else(|| CrewError::Structural(format!("agent '{}' is not instantiated", task.agent)))?;
        let context = match mode {
            ContextMode::Accumulated => run.ledger.succeeded_outputs(),
            ContextMode::Dependencies => run.ledger.outputs_of(crew.graph.dependencies(id)),
        };
        Ok(TaskJob {
            last_output_key: crew.output_scope.as_ref().map(|scope| format!("{scope}:{id}")),
            input: TaskInput {
                inputs: run.ledger.inputs(),
                context,
                simplified: false,
            },
            task,
            agent,
            options: crew.options.clone(),
            ledger: run.ledger.clone(),
            store: self.store.clone(),
        })
    }

    /// 记录终态、写检查点与运行中状态；返回任务终态
    async fn settle(&self, run: &Run, id: &str, outcome: TaskOutcome) -> TaskState {
        let state = outcome.state();
        let last_good = match &outcome {
            TaskOutcome::Succeeded { output, .. } if !output.degraded => Some(output.clone()),
            _ => None,
        };
        let snapshot = run.ledger.settle(id, outcome);

        match snapshot.to_value() {
            Ok(value) => {
                if let Err(e) = self.store.create_checkpoint(&run.execution_id, &value).await {
                    tracing::error!(execution_id = %run.execution_id, task_id = %id, error = %e, "failed to write checkpoint");
                }
                if let Err(e) = self
                    .store
                    .save_state(&live_state_key(&run.execution_id), &value, self.settings.state_ttl)
                    .await
                {
                    tracing::warn!(execution_id = %run.execution_id, error = %e, "failed to save live state");
                }
            }
            Err(e) => tracing::error!(execution_id = %run.execution_id, error = %e, "failed to serialize snapshot"),
        }

        if let (Some(output), Some(scope)) = (last_good, &run.crew.output_scope) {
            match serde_json::to_value(&output) {
                Ok(value) => {
                    let key = format!("{scope}:{id}");
                    if let Err(e) = self.store.save_state(&key, &value, self.settings.state_ttl).await {
                        tracing::warn!(task_id = %id, error = %e, "failed to store last good output");
                    }
                }
                Err(e) => tracing::warn!(task_id = %id, error = %e, "failed to serialize task output"),
            }
        }

        tracing::info!(execution_id = %run.execution_id, task_id = %id, state = ?state, "task settled");
        state
    }

    async fn save_live(&self, snapshot: &ExecutionSnapshot) {
        let result = match snapshot.to_value() {
            Ok(value) => {
                self.store
                    .save_state(&live_state_key(&snapshot.execution_id), &value, self.settings.state_ttl)
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::warn!(execution_id = %snapshot.execution_id, error = %e, "failed to save live state");
        }
    }

    async fn run_sequential(&self, run: &Run) -> Result<(), CrewError> {
        let mut stop: Option<SkipReason> = None;
        for id in run.crew.graph.topological_order() {
            if run.ledger.state(&id) == TaskState::Succeeded {
                continue;
            }
            if let Some(reason) = stop {
                run.ledger.skip(&id, reason);
                continue;
            }
            self.check_deadline(run)?;

            let job = self.job(run, &id, ContextMode::Accumulated)?;
            let (_, result) = job.run(self.recovery.clone()).await;
            let outcome = result?;
            let terminate = matches!(&outcome, TaskOutcome::Succeeded { output, .. } if output.terminate);
            let degraded = matches!(&outcome, TaskOutcome::Succeeded { output, .. } if output.degraded);

            match self.settle(run, &id, outcome).await {
                TaskState::Failed => stop = Some(SkipReason::EarlyStop),
                _ if terminate => stop = Some(SkipReason::Terminated),
                _ if degraded => stop = Some(SkipReason::EarlyStop),
                _ => {}
            }
            if let Some(reason) = stop {
                tracing::info!(execution_id = %run.execution_id, task_id = %id, reason = ?reason, "sequential run stopping early");
            }
        }
        Ok(())
    }

    /// 就绪的未完成任务（依赖全部成功），按声明顺序
    fn initially_ready(&self, run: &Run) -> Vec<TaskId> {
        let graph = &run.crew.graph;
        graph
            .task_ids()
            .iter()
            .filter(|id| run.ledger.state(id) != TaskState::Succeeded)
            .filter(|id| {
                graph
                    .dependencies(id)
                    .iter()
                    .all(|dep| run.ledger.state(dep) == TaskState::Succeeded)
            })
            .cloned()
            .collect()
    }

    /// worker 池：按队列顺序启动，最多 max_workers 个同时执行
    ///
    /// dynamic 为 true 时，任务成功后把新就绪的下游任务追加到队尾。
    async fn run_pool(&self, run: &Run, initial: Vec<TaskId>, dynamic: bool) -> Result<(), CrewError> {
        let graph = &run.crew.graph;
        let workers = run.crew.def.config.max_workers.max(1);
        let mut queue: VecDeque<TaskId> = initial.into_iter().collect();
        let mut queued: HashSet<TaskId> = queue.iter().cloned().collect();
        let mut set = JoinSet::new();

        loop {
            while set.len() < workers {
                let Some(id) = queue.pop_front() else {
                    break;
                };
                if run.ledger.state(&id).is_terminal() {
                    continue;
                }
                self.check_deadline(run)?;
                let job = self.job(run, &id, ContextMode::Dependencies)?;
                run.ledger.set_state(&id, TaskState::Running);
                tracing::debug!(execution_id = %run.execution_id, task_id = %id, in_flight = set.len() + 1, "dispatching task");
                set.spawn(job.run(self.recovery.clone()));
            }

            let Some(joined) = set.join_next().await else {
                break;
            };
            let (id, result) = joined.map_err(|e| CrewError::Systemic(format!("task join failed: {e}")))?;
            match self.settle(run, &id, result?).await {
                TaskState::Succeeded if dynamic => {
                    for next in graph.dependents(&id) {
                        let ready = graph
                            .dependencies(next)
                            .iter()
                            .all(|dep| run.ledger.state(dep) == TaskState::Succeeded);
                        if ready && !queued.contains(next) {
                            queued.insert(next.clone());
                            queue.push_back(next.clone());
                        }
                    }
                }
                TaskState::Failed => {
                    for dependent in graph.transitive_dependents(&id) {
                        if run.ledger.skip(&dependent, SkipReason::UpstreamFailed) {
                            tracing::info!(execution_id = %run.execution_id, task_id = %dependent, upstream = %id, "skipping task with failed upstream");
                        }
                    }
                }
                _ => {}
            }
        }

        if dynamic {
            for id in run.ledger.skip_unfinished(SkipReason::Unreachable) {
                tracing::debug!(execution_id = %run.execution_id, task_id = %id, "task never became ready");
            }
        }
        Ok(())
    }

    async fn run_hierarchical(&self, run: &Run) -> Result<(), CrewError> {
        let crew = &run.crew;
        let manager_id = crew
            .def
            .manager_task
            .clone()
            .ok_or_else(|| CrewError::Structural("hierarchical crew has no manager task".into()))?;

        if run.ledger.state(&manager_id) != TaskState::Succeeded {
            self.check_deadline(run)?;
            let job = self.job(run, &manager_id, ContextMode::Dependencies)?;
            let (_, result) = job.run(self.recovery.clone()).await;
            self.settle(run, &manager_id, result?).await;
        }

        let remaining = |ids: &[TaskId]| -> Vec<TaskId> {
            ids.iter()
                .filter(|id| **id != manager_id && !run.ledger.state(id).is_terminal())
                .cloned()
                .collect()
        };
        let fallback_phases = || -> Vec<Vec<TaskId>> {
            crew.graph
                .phases()
                .iter()
                .map(|phase| remaining(phase.as_slice()))
                .filter(|phase| !phase.is_empty())
                .collect()
        };

        let plan = run
            .ledger
            .output(&manager_id)
            .filter(|o| !o.degraded)
            .and_then(|o| parse_phases(&o.value, crew, &remaining(crew.graph.task_ids())));
        let mut phases: VecDeque<Vec<TaskId>> = match plan {
            Some(phases) => {
                tracing::info!(execution_id = %run.execution_id, phases = phases.len(), "executing manager plan");
                phases.into()
            }
            None => {
                tracing::warn!(execution_id = %run.execution_id, "manager plan unavailable, using dependency phases");
                fallback_phases().into()
            }
        };

        while let Some(phase) = phases.pop_front() {
            self.check_deadline(run)?;

            let mut runnable = Vec::new();
            let mut deferred = Vec::new();
            for id in phase {
                if run.ledger.state(&id).is_terminal() {
                    continue;
                }
                let deps = crew.graph.dependencies(&id);
                if deps.iter().any(|d| matches!(run.ledger.state(d), TaskState::Failed | TaskState::Skipped)) {
                    run.ledger.skip(&id, SkipReason::UpstreamFailed);
                } else if deps.iter().all(|d| run.ledger.state(d) == TaskState::Succeeded) {
                    runnable.push(id);
                } else {
                    deferred.push(id);
                }
            }
            if !deferred.is_empty() {
                tracing::debug!(execution_id = %run.execution_id, deferred = ?deferred, "deferring tasks with unfinished upstream");
                match phases.front_mut() {
                    Some(next) => deferred.into_iter().rev().for_each(|id| next.insert(0, id)),
                    None => phases.push_back(deferred),
                }
            }
            if runnable.is_empty() {
                continue;
            }

            self.run_pool(run, runnable, false).await?;

            if self.settings.review_phases && !phases.is_empty() {
                if let Some(revised) = self.review(run, &manager_id, &phases).await? {
                    phases = revised;
                }
            }
        }

        for id in run.ledger.skip_unfinished(SkipReason::Unreachable) {
            tracing::debug!(execution_id = %run.execution_id, task_id = %id, "task left out of the plan");
        }
        Ok(())
    }

    /// manager 复核：可跳过或重排剩余阶段；复核失败时保持原计划
    async fn review(
        &self,
        run: &Run,
        manager_id: &str,
        phases: &VecDeque<Vec<TaskId>>,
    ) -> Result<Option<VecDeque<Vec<TaskId>>>, CrewError> {
        let crew = &run.crew;
        let Some(manager) = crew.def.task(manager_id) else {
            return Ok(None);
        };
        let Some(agent) = crew.agents.get(&manager.agent) else {
            return Ok(None);
        };

        let remaining: Vec<TaskId> = phases.iter().flatten().cloned().collect();
        let review_task = TaskSpec::new(
            format!("{manager_id}:review"),
            format!(
                "Review the outputs produced so far and decide how to continue. Remaining phases: {}. \
                 Return \"phases\" as the new grouping of the remaining tasks and \"skip\" as tasks that are no longer needed.",
                json!(phases)
            ),
            manager.agent.clone(),
        )
        .expecting(OutputContract::json(&["phases"]));
        let input = TaskInput {
            inputs: run.ledger.inputs(),
            context: run.ledger.succeeded_outputs(),
            simplified: false,
        };

        let value = match agent.perform(&review_task, &input, &crew.options).await {
            Ok((value, _)) => value,
            Err(e) if e.propagates() => return Err(e),
            Err(e) => {
                tracing::warn!(execution_id = %run.execution_id, error = %e, "manager review failed, keeping plan");
                return Ok(None);
            }
        };

        let skip: Vec<TaskId> = value
            .get("skip")
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(Value::as_str)
                    .filter(|id| remaining.iter().any(|r| r == id))
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        for id in &skip {
            if run.ledger.skip(id, SkipReason::ManagerSkipped) {
                tracing::info!(execution_id = %run.execution_id, task_id = %id, "manager skipped task");
            }
        }

        let still_pending: Vec<TaskId> = remaining
            .into_iter()
            .filter(|id| !run.ledger.state(id).is_terminal())
            .collect();
        Ok(parse_phases(&value, crew, &still_pending).map(VecDeque::from))
    }
}

/// 解析 `{"phases": [[...], ...]}`：只保留 pending 集合中的任务，去重，遗漏的任务按依赖层级追加到最后
fn parse_phases(value: &Value, crew: &Crew, pending: &[TaskId]) -> Option<Vec<Vec<TaskId>>> {
    let raw = value.get("phases")?.as_array()?;
    let pending_set: HashSet<&TaskId> = pending.iter().collect();
    let mut placed: HashSet<TaskId> = HashSet::new();

    let mut phases: Vec<Vec<TaskId>> = Vec::new();
    for group in raw {
        let ids: Vec<TaskId> = match group {
            Value::Array(items) => items.iter().filter_map(Value::as_str).map(String::from).collect(),
            Value::String(id) => vec![id.clone()],
            _ => continue,
        };
        let phase: Vec<TaskId> = ids
            .into_iter()
            .filter(|id| pending_set.contains(id) && placed.insert(id.clone()))
            .collect();
        if !phase.is_empty() {
            phases.push(phase);
        }
    }
    if phases.is_empty() && !pending.is_empty() {
        return None;
    }

    for layer in crew.graph.phases() {
        let missing: Vec<TaskId> = layer
            .into_iter()
            .filter(|id| pending_set.contains(id) && !placed.contains(id))
            .collect();
        if !missing.is_empty() {
            phases.push(missing);
        }
    }
    Some(phases)
}
