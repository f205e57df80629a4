//! CrewService 集成测试：异步提交、排队、取消与结果归属

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{executor, TaskBackend};
use crewline::core::ExecutionContext;
use crewline::crew::{AgentSpec, CrewDefinition, CrewRegistry, TaskSpec};
use crewline::crews::builtin_registry;
use crewline::config::CrewSection;
use crewline::service::{CrewService, ExecutionStatus, ServiceSettings};
use serde_json::json;

fn registry() -> CrewRegistry {
    let mut registry = CrewRegistry::new();
    registry.register_definition(
        "report",
        CrewDefinition::builder("report")
            .agent(AgentSpec::new("writer", "Writer", "write reports"))
            .task(TaskSpec::new("outline", "write the outline", "writer"))
            .task(TaskSpec::new("body", "write the body", "writer").depends_on(["outline"]))
            .build()
            .unwrap(),
    );
    registry
}

fn service(backend: Arc<TaskBackend>, max_concurrent_runs: usize) -> Arc<CrewService> {
    let (executor, _) = executor(backend);
    Arc::new(CrewService::new(
        executor,
        registry(),
        ServiceSettings {
            max_concurrent_runs,
            retention: Duration::from_secs(3600),
        },
    ))
}

async fn wait_for<F>(svc: &CrewService, id: &str, done: F)
where
    F: Fn(&crewline::service::StatusReport) -> bool,
{
    for _ in 0..200 {
        if let Some(status) = svc.get_status(id).await {
            if done(&status) {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("execution {id} did not reach the expected state");
}

#[tokio::test(start_paused = true)]
async fn test_cancel_mid_task_keeps_last_checkpoint_only() {
    let backend = TaskBackend::new();
    backend.delay("write the body", Duration::from_secs(30));
    let svc = service(backend.clone(), 4);
    let alice = ExecutionContext::new("acme", "alice");

    let id = svc.submit("report", alice, json!({})).await.unwrap();
    wait_for(&svc, &id, |s| s.completed_task_ids.contains(&"outline".to_string())).await;
    wait_for(&svc, &id, |_| backend.attempts("write the body") == 1).await;

    assert!(!svc.cancel(&id, "mallory").await);
    assert!(svc.cancel(&id, "alice").await);
    assert!(!svc.cancel(&id, "alice").await);
    assert_eq!(svc.get_status(&id).await.unwrap().status, ExecutionStatus::Cancelled);

    let result = svc.get_results(&id, "alice").await.unwrap().unwrap();
    assert!(!result.success);
    assert_eq!(result.results.len(), 1);
    assert!(result.results.contains_key("outline"));
    assert!(!result.results.contains_key("body"));
    assert_eq!(svc.get_results(&id, "mallory").await.unwrap(), None);

    // 后到的运行结束不会覆盖取消状态
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(svc.get_status(&id).await.unwrap().status, ExecutionStatus::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn test_runs_beyond_limit_are_queued() {
    let backend = TaskBackend::new();
    backend.delay("write the outline", Duration::from_secs(5));
    let svc = service(backend.clone(), 1);

    let first = svc
        .submit("report", ExecutionContext::new("acme", "alice"), json!({}))
        .await
        .unwrap();
    wait_for(&svc, &first, |s| s.status == ExecutionStatus::Running).await;
    let second = svc
        .submit("report", ExecutionContext::new("acme", "bob"), json!({}))
        .await
        .unwrap();
    wait_for(&svc, &second, |s| s.status == ExecutionStatus::Queued).await;

    wait_for(&svc, &second, |s| s.status == ExecutionStatus::Completed).await;
    assert_eq!(svc.get_status(&first).await.unwrap().status, ExecutionStatus::Completed);
    assert!(svc.get_results(&second, "bob").await.unwrap().unwrap().success);
}

#[tokio::test]
async fn test_cancel_after_completion_is_rejected() {
    let svc = service(TaskBackend::new(), 2);
    let result = svc
        .execute("report", ExecutionContext::new("acme", "alice"), json!({}))
        .await
        .unwrap();
    let id = result.metadata["execution_id"].as_str().unwrap();
    assert!(!svc.cancel(id, "alice").await);
    assert_eq!(svc.get_status(id).await.unwrap().status, ExecutionStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_resume_after_cancel_completes_remaining_tasks() {
    let backend = TaskBackend::new();
    backend.delay("write the body", Duration::from_secs(30));
    let svc = service(backend.clone(), 2);

    let id = svc
        .submit("report", ExecutionContext::new("acme", "alice"), json!({}))
        .await
        .unwrap();
    wait_for(&svc, &id, |_| backend.attempts("write the body") == 1).await;
    assert!(svc.cancel(&id, "alice").await);

    let result = svc.resume(&id, "alice").await.unwrap();
    assert!(result.success);
    assert_eq!(backend.attempts("write the outline"), 1);
    assert_eq!(backend.attempts("write the body"), 2);
    assert_eq!(svc.get_status(&id).await.unwrap().status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn test_builtin_inventory_assessment_runs_end_to_end() {
    let backend = TaskBackend::new();
    backend.text(
        "Recommend one migration strategy",
        r#"Here is my answer: {"strategy": "Phased Migration", "rationale": "large database", "confidence": 0.85,}"#,
    );
    let (executor, _) = executor(backend.clone());
    let svc = CrewService::new(executor, builtin_registry(&CrewSection::default()), ServiceSettings::default());

    let inputs = json!({
        "target": {
            "resources": [
                {"id": "db1", "name": "orders", "resource_type": "database", "storage_gb": 1500.0,
                 "environment": "prod", "criticality": "High", "owner": "dba"},
                {"id": "vm1", "name": "web", "resource_type": "vm"}
            ]
        }
    });
    let result = svc
        .execute("inventory_assessment", ExecutionContext::new("acme", "alice"), inputs)
        .await
        .unwrap();

    assert!(result.success, "{result:?}");
    assert_eq!(result.results["discover"]["count"], json!(2));
    assert_eq!(result.results["validate"]["validations"].as_array().unwrap().len(), 2);
    assert_eq!(result.results["recommend"]["strategy"], "Phased Migration");
    assert_eq!(backend.attempts("Recommend one migration strategy"), 1);
}
