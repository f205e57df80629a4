//! Crew 执行集成测试：sequential / parallel / hierarchical、恢复、检查点与时间预算

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{executor, executor_with, TaskBackend};
use crewline::core::{CrewError, ExecutionContext};
use crewline::crew::{
    AgentSpec, CrewConfig, CrewDefinition, ExecutorSettings, OutputContract, Process, RunControl,
    TaskSpec, TaskState,
};
use crewline::llm::InferenceError;
use crewline::recovery::{
    ErrorCategory, RecoveryEngine, RecoveryPolicy, RecoverySettings, RecoveryStrategy,
};
use crewline::state::{ExecutionSnapshot, InMemoryStateStore, StateStore};
use serde_json::json;

fn ctx() -> ExecutionContext {
    ExecutionContext::new("acme", "alice")
}

fn writer() -> AgentSpec {
    AgentSpec::new("writer", "Writer", "write things")
}

fn chain(ids: &[&str]) -> CrewDefinition {
    let mut builder = CrewDefinition::builder("chain").agent(writer());
    let mut previous: Option<&str> = None;
    for id in ids {
        let mut task = TaskSpec::new(*id, format!("step {id}"), "writer");
        if let Some(prev) = previous {
            task = task.depends_on([prev]);
        }
        builder = builder.task(task);
        previous = Some(id);
    }
    builder.build().unwrap()
}

fn strict_recovery(max_task_retries: u32) -> RecoveryEngine {
    RecoveryEngine::new(
        RecoveryPolicy::new(false),
        RecoverySettings {
            max_task_retries,
            ..RecoverySettings::default()
        },
    )
}

fn state_of(result: &crewline::CrewResult, id: &str) -> String {
    result.metadata["task_states"][id].as_str().unwrap_or_default().to_string()
}

#[tokio::test(start_paused = true)]
async fn test_sequential_retry_recovers_task_with_discount() {
    let backend = TaskBackend::new();
    backend.reply("step b", |attempt| {
        if attempt <= 2 {
            Err(InferenceError::Network("connection reset".into()))
        } else {
            Ok("B".into())
        }
    });
    let (executor, store) = executor(backend.clone());

    let result = executor
        .run("chain", &chain(&["a", "b", "c"]), &ctx(), json!({}), RunControl::new("exec-seq"))
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.results["b"], json!("B"));
    assert_eq!(backend.attempts("step b"), 3);
    // (1.0 + 0.9 + 1.0) / 3
    assert!((result.confidence - 2.9 / 3.0).abs() < 1e-9);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].task_id.as_deref(), Some("b"));
    assert_eq!(result.errors[0].recovered_by, Some(RecoveryStrategy::RetryWithBackoff));

    // 只在终态写检查点：恢复窗口内的失败尝试不产生检查点
    let checkpoints = store.list_checkpoints("exec-seq", 10).await.unwrap();
    assert_eq!(checkpoints.len(), 3);
    assert_eq!(checkpoints[0].sequence, 3);
}

#[tokio::test]
async fn test_sequential_stops_on_terminate_signal() {
    let backend = TaskBackend::new();
    backend.text("step a", r#"{"terminate": true, "answer": 42}"#);
    let def = CrewDefinition::builder("early")
        .agent(writer())
        .task(TaskSpec::new("a", "step a", "writer").expecting(OutputContract::json(&["answer"])))
        .task(TaskSpec::new("b", "step b", "writer").depends_on(["a"]))
        .build()
        .unwrap();
    let (executor, _) = executor(backend.clone());

    let result = executor
        .run("early", &def, &ctx(), json!({}), RunControl::new("exec-term"))
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.results.len(), 1);
    assert_eq!(state_of(&result, "b"), "skipped");
    assert_eq!(result.metadata["skip_reasons"]["b"], json!("terminated"));
    assert_eq!(backend.attempts("step b"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_sequential_unrecovered_failure_aborts_run() {
    let backend = TaskBackend::new();
    backend.reply("step b", |_| Err(InferenceError::Network("down".into())));
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::default());
    let executor = executor_with(backend.clone(), store, strict_recovery(1), ExecutorSettings::default());

    let result = executor
        .run("chain", &chain(&["a", "b", "c"]), &ctx(), json!({}), RunControl::new("exec-abort"))
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(state_of(&result, "b"), "failed");
    assert_eq!(state_of(&result, "c"), "skipped");
    assert_eq!(backend.attempts("step c"), 0);
    assert!(result.errors.iter().any(|e| e.task_id.as_deref() == Some("b") && e.recovered_by.is_none()));
}

fn optional_then_critical(process: Process) -> CrewDefinition {
    CrewDefinition::builder("optional-upstream")
        .process(process)
        .agent(writer())
        .task(TaskSpec::new("a", "step a", "writer").non_critical())
        .task(TaskSpec::new("b", "step b", "writer").depends_on(["a"]))
        .build()
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_sequential_critical_task_skipped_after_degraded_upstream_fails_crew() {
    let backend = TaskBackend::new();
    backend.reply("step a", |_| Err(InferenceError::Network("down".into())));
    let (executor, _) = executor(backend.clone());

    let result = executor
        .run(
            "optional-upstream",
            &optional_then_critical(Process::Sequential),
            &ctx(),
            json!({}),
            RunControl::new("exec-degraded-upstream"),
        )
        .await
        .unwrap();

    assert_eq!(state_of(&result, "a"), "succeeded");
    assert_eq!(result.results["a"]["degraded"], json!(true));
    assert_eq!(state_of(&result, "b"), "skipped");
    assert_eq!(backend.attempts("step b"), 0);
    assert!(!result.success);
    assert_eq!(result.metadata["skip_reasons"]["b"], json!("early_stop"));
}

#[tokio::test(start_paused = true)]
async fn test_parallel_critical_task_skipped_after_failed_upstream_fails_crew() {
    let backend = TaskBackend::new();
    backend.reply("step a", |_| Err(InferenceError::Network("down".into())));
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::default());
    let executor = executor_with(backend.clone(), store, strict_recovery(1), ExecutorSettings::default());

    let result = executor
        .run(
            "optional-upstream",
            &optional_then_critical(Process::Parallel),
            &ctx(),
            json!({}),
            RunControl::new("exec-failed-upstream"),
        )
        .await
        .unwrap();

    assert_eq!(state_of(&result, "a"), "failed");
    assert_eq!(state_of(&result, "b"), "skipped");
    assert_eq!(backend.attempts("step b"), 0);
    assert!(!result.success);
    assert_eq!(result.metadata["skip_reasons"]["b"], json!("upstream_failed"));
}

#[tokio::test(start_paused = true)]
async fn test_open_circuit_degrades_without_calling_backend() {
    let backend = TaskBackend::new();
    backend.reply("step a", |_| Err(InferenceError::Network("down".into())));
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::default());
    let recovery = RecoveryEngine::new(
        RecoveryPolicy::new(true),
        RecoverySettings {
            max_task_retries: 0,
            ..RecoverySettings::default()
        },
    );
    let executor = executor_with(backend.clone(), store, recovery, ExecutorSettings::default());
    let def = chain(&["a"]);

    // 每次运行一次失败调用，第五次后熔断器打开
    for i in 0..5 {
        let result = executor
            .run("chain", &def, &ctx(), json!({}), RunControl::new(format!("exec-trip-{i}")))
            .await
            .unwrap();
        assert_eq!(result.errors[0].category, ErrorCategory::Network);
    }
    assert_eq!(backend.attempts("step a"), 5);

    let result = executor
        .run("chain", &def, &ctx(), json!({}), RunControl::new("exec-open"))
        .await
        .unwrap();

    assert_eq!(backend.attempts("step a"), 5);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].category, ErrorCategory::ModelUnavailable);
    assert_eq!(result.errors[0].recovered_by, Some(RecoveryStrategy::DegradedService));
    assert_eq!(result.results["a"]["degraded"], json!(true));
}

#[tokio::test(start_paused = true)]
async fn test_parallel_respects_worker_ceiling_and_fifo_order() {
    let backend = TaskBackend::new();
    let mut builder = CrewDefinition::builder("fanout").process(Process::Parallel).agent(writer());
    for id in ["t1", "t2", "t3", "t4"] {
        let description = format!("job {id}");
        backend.delay(&description, Duration::from_millis(100));
        builder = builder.task(TaskSpec::new(id, description, "writer"));
    }
    let def = builder
        .config(CrewConfig {
            max_workers: 2,
            ..CrewConfig::default()
        })
        .build()
        .unwrap();
    let (executor, _) = executor(backend.clone());

    let result = executor
        .run("fanout", &def, &ctx(), json!({}), RunControl::new("exec-par"))
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.results.len(), 4);
    assert_eq!(backend.max_in_flight(), 2);
    assert_eq!(backend.started(), vec!["job t1", "job t2", "job t3", "job t4"]);
}

#[tokio::test(start_paused = true)]
async fn test_parallel_failure_only_skips_dependents() {
    let backend = TaskBackend::new();
    backend.reply("fetch", |_| Err(InferenceError::Network("down".into())));
    let def = CrewDefinition::builder("mixed")
        .process(Process::Parallel)
        .agent(writer())
        .task(TaskSpec::new("a", "fetch", "writer"))
        .task(TaskSpec::new("b", "summarize", "writer").depends_on(["a"]))
        .task(TaskSpec::new("c", "unrelated", "writer"))
        .build()
        .unwrap();
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::default());
    let executor = executor_with(backend.clone(), store, strict_recovery(1), ExecutorSettings::default());

    let result = executor
        .run("mixed", &def, &ctx(), json!({}), RunControl::new("exec-mixed"))
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(state_of(&result, "a"), "failed");
    assert_eq!(state_of(&result, "b"), "skipped");
    assert_eq!(result.results["c"], json!("done: unrelated"));
    assert_eq!(backend.attempts("summarize"), 0);
    assert!((result.confidence - 1.0 / 3.0).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn test_resume_reuses_succeeded_outputs() {
    let backend = TaskBackend::new();
    backend.reply("step c", |_| Err(InferenceError::Network("down".into())));
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::default());
    let executor = executor_with(backend.clone(), store.clone(), strict_recovery(1), ExecutorSettings::default());
    let def = chain(&["a", "b", "c"]);

    let first = executor
        .run("chain", &def, &ctx(), json!({}), RunControl::new("exec-resume"))
        .await
        .unwrap();
    assert!(!first.success);

    let checkpoint = store.latest_checkpoint("exec-resume").await.unwrap().unwrap();
    let mut outputs = Vec::new();
    for attempt in 0..2 {
        let retry_backend = TaskBackend::new();
        let resumed_executor =
            executor_with(retry_backend.clone(), store.clone(), strict_recovery(1), ExecutorSettings::default());
        let snapshot =
            ExecutionSnapshot::from_value(store.restore(&checkpoint.id).await.unwrap().unwrap()).unwrap();
        assert_eq!(snapshot.task_states["c"], TaskState::Failed);

        let resumed = resumed_executor
            .resume(&def, snapshot, RunControl::new(format!("exec-resume-{attempt}")))
            .await
            .unwrap();
        assert!(resumed.success);
        assert_eq!(retry_backend.attempts("step a"), 0);
        assert_eq!(retry_backend.attempts("step b"), 0);
        assert_eq!(retry_backend.attempts("step c"), 1);
        outputs.push((resumed.results["a"].clone(), resumed.results["b"].clone()));
    }
    assert_eq!(outputs[0], outputs[1]);
    assert_eq!(outputs[0].0, first.results["a"]);
}

#[tokio::test]
async fn test_agent_memory_is_shared_per_crew_type_and_capped() {
    let backend = TaskBackend::new();
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::default());
    let executor = executor_with(
        backend.clone(),
        store.clone(),
        RecoveryEngine::default(),
        ExecutorSettings {
            short_term_entries: 2,
            ..ExecutorSettings::default()
        },
    );
    let mut def = chain(&["a"]);
    def.config.memory = true;

    for i in 0..3 {
        executor
            .run("chain", &def, &ctx(), json!({}), RunControl::new(format!("exec-mem-{i}")))
            .await
            .unwrap();
    }
    let other_org = ExecutionContext::new("globex", "bob");
    executor
        .run("chain", &def, &other_org, json!({}), RunControl::new("exec-mem-globex"))
        .await
        .unwrap();

    let acme = store.recent_memory("memory:org:acme:chain:writer", 10).await.unwrap();
    assert_eq!(acme.len(), 2);
    assert_eq!(acme[0].payload["task_id"], json!("a"));
    let globex = store.recent_memory("memory:org:globex:chain:writer", 10).await.unwrap();
    assert_eq!(globex.len(), 1);
    assert!(store.recent_memory("memory:exec-mem-0:writer", 10).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_wall_clock_budget_yields_degraded_result() {
    let backend = TaskBackend::new();
    backend.delay("step a", Duration::from_secs(30));
    let mut def = chain(&["a", "b"]);
    def.config.wall_clock_budget_secs = 5;
    let (executor, _) = executor(backend.clone());

    let result = executor
        .run("chain", &def, &ctx(), json!({}), RunControl::new("exec-budget"))
        .await
        .unwrap();

    assert!(!result.success);
    assert!(result.is_degraded());
    assert_eq!(result.metadata["budget_exceeded"], json!(true));
    assert_eq!(state_of(&result, "a"), "skipped");
    assert_eq!(state_of(&result, "b"), "skipped");
    assert_eq!(result.errors.last().unwrap().recovered_by, Some(RecoveryStrategy::DegradedService));
}

#[tokio::test]
async fn test_cancelled_before_start_returns_error() {
    let (executor, _) = executor(TaskBackend::new());
    let control = RunControl::new("exec-cancel");
    control.cancel.cancel();
    let err = executor
        .run("chain", &chain(&["a"]), &ctx(), json!({}), control)
        .await
        .unwrap_err();
    assert!(matches!(err, CrewError::Cancelled));
}

#[tokio::test]
async fn test_unregistered_tool_is_structural() {
    let def = CrewDefinition::builder("tools")
        .agent(writer().with_tools(&["teleport"]))
        .task(TaskSpec::new("a", "step a", "writer"))
        .build()
        .unwrap();
    let (executor, _) = executor(TaskBackend::new());
    let err = executor
        .run("tools", &def, &ctx(), json!({}), RunControl::new("exec-tools"))
        .await
        .unwrap_err();
    assert!(matches!(err, CrewError::Structural(_)));
}

#[tokio::test]
async fn test_authentication_failure_propagates() {
    let backend = TaskBackend::new();
    backend.reply("step a", |_| Err(InferenceError::Authentication { status: 401 }));
    let (executor, _) = executor(backend.clone());
    let err = executor
        .run("chain", &chain(&["a", "b"]), &ctx(), json!({}), RunControl::new("exec-auth"))
        .await
        .unwrap_err();
    assert!(matches!(err, CrewError::Authentication(_)));
    assert_eq!(backend.attempts("step a"), 1);
}

fn hierarchical() -> CrewDefinition {
    CrewDefinition::builder("managed")
        .agent(AgentSpec::new("lead", "Lead", "plan the work"))
        .agent(writer())
        .manager(
            TaskSpec::new("plan", "plan the work", "lead").expecting(OutputContract::json(&["phases"])),
        )
        .task(TaskSpec::new("a", "step a", "writer"))
        .task(TaskSpec::new("b", "step b", "writer"))
        .task(TaskSpec::new("c", "step c", "writer").depends_on(["a"]))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_hierarchical_follows_manager_plan() {
    let backend = TaskBackend::new();
    backend.text("plan the work", r#"{"phases": [["b"], ["c", "a"]]}"#);
    let executor = executor_with(
        backend.clone(),
        Arc::new(InMemoryStateStore::default()),
        RecoveryEngine::default(),
        ExecutorSettings {
            review_phases: false,
            ..ExecutorSettings::default()
        },
    );

    let result = executor
        .run("managed", &hierarchical(), &ctx(), json!({}), RunControl::new("exec-plan"))
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.results.len(), 4);
    // c 依赖 a，被推迟到 a 之后
    assert_eq!(backend.started(), vec!["plan the work", "step b", "step a", "step c"]);
}

#[tokio::test]
async fn test_hierarchical_review_can_skip_remaining_tasks() {
    let backend = TaskBackend::new();
    backend.text("plan the work", r#"{"phases": [["a"], ["b"], ["c"]]}"#);
    let review_calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = review_calls.clone();
    backend.reply("Review the outputs", move |_| {
        counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(r#"{"phases": [["c"]], "skip": ["b"]}"#.into())
    });
    let (executor, _) = executor(backend.clone());

    let result = executor
        .run("managed", &hierarchical(), &ctx(), json!({}), RunControl::new("exec-review"))
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(state_of(&result, "b"), "skipped");
    assert_eq!(state_of(&result, "c"), "succeeded");
    assert_eq!(result.metadata["skip_reasons"]["b"], json!("manager_skipped"));
    assert_eq!(backend.attempts("step b"), 0);
    assert!(review_calls.load(std::sync::atomic::Ordering::SeqCst) >= 1);
}

#[tokio::test(start_paused = true)]
async fn test_hierarchical_falls_back_to_dependency_phases() {
    let backend = TaskBackend::new();
    backend.reply("plan the work", |_| Err(InferenceError::InvalidResponse("garbled".into())));
    let executor = executor_with(
        backend.clone(),
        Arc::new(InMemoryStateStore::default()),
        RecoveryEngine::default(),
        ExecutorSettings {
            review_phases: false,
            ..ExecutorSettings::default()
        },
    );

    let result = executor
        .run("managed", &hierarchical(), &ctx(), json!({}), RunControl::new("exec-fallback"))
        .await
        .unwrap();

    assert_eq!(result.results.len(), 4);
    assert_eq!(&backend.started()[backend.started().len() - 3..], ["step a", "step b", "step c"]);
}
