//! 集成测试共用：按任务脚本化的推理后端与执行器装配

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use crewline::crew::{CrewExecutor, ExecutorSettings};
use crewline::llm::{
    ClientConfig, InferenceBackend, InferenceClient, InferenceError, InferenceRequest,
    InferenceResponse, MockBackend,
};
use crewline::recovery::RecoveryEngine;
use crewline::state::{InMemoryStateStore, StateStore};
use crewline::tools::default_registry;

type Reply = Arc<dyn Fn(usize) -> Result<String, InferenceError> + Send + Sync>;

/// 按任务描述分派响应的后端；记录开始顺序与最大并发
#[derive(Default)]
pub struct TaskBackend {
    replies: Mutex<HashMap<String, Reply>>,
    delays: Mutex<HashMap<String, Duration>>,
    attempts: Mutex<HashMap<String, usize>>,
    started: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl TaskBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 为描述以 description 开头的任务设置响应；参数为该任务第几次调用（从 1 开始）
    pub fn reply<F>(&self, description: &str, f: F)
    where
        F: Fn(usize) -> Result<String, InferenceError> + Send + Sync + 'static,
    {
        self.replies
            .lock()
            .unwrap()
            .insert(description.to_string(), Arc::new(f));
    }

    pub fn text(&self, description: &str, content: &str) {
        let content = content.to_string();
        self.reply(description, move |_| Ok(content.clone()));
    }

    pub fn delay(&self, description: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(description.to_string(), delay);
    }

    /// 描述以 description 开头的任务调用次数之和
    pub fn attempts(&self, description: &str) -> usize {
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .filter(|(task, _)| task.starts_with(description))
            .map(|(_, n)| *n)
            .sum()
    }

    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

/// 精确匹配优先，其次按前缀匹配
fn lookup<V: Clone>(map: &HashMap<String, V>, task: &str) -> Option<V> {
    map.get(task).cloned().or_else(|| {
        map.iter()
            .find(|(key, _)| task.starts_with(key.as_str()))
            .map(|(_, v)| v.clone())
    })
}

/// 请求中的任务描述（"Task: ..." 消息）
pub fn task_of(request: &InferenceRequest) -> String {
    request
        .messages
        .iter()
        .find_map(|m| m.content.strip_prefix("Task: "))
        .unwrap_or_default()
        .to_string()
}

#[async_trait]
impl InferenceBackend for TaskBackend {
    fn endpoint(&self) -> &str {
        "test://tasks"
    }

    fn default_model(&self) -> &str {
        "test-model"
    }

    async fn send(&self, request: &InferenceRequest) -> Result<InferenceResponse, InferenceError> {
        let task = task_of(request);
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let n = attempts.entry(task.clone()).or_insert(0);
            *n += 1;
            *n
        };
        self.started.lock().unwrap().push(task.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = lookup(&self.delays.lock().unwrap(), &task);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        } else {
            tokio::task::yield_now().await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let reply = lookup(&self.replies.lock().unwrap(), &task);
        match reply {
            Some(reply) => reply(attempt).map(|content| MockBackend::text_response("test-model", content)),
            None => Ok(MockBackend::text_response("test-model", format!("done: {task}"))),
        }
    }
}

pub fn client_config() -> ClientConfig {
    ClientConfig {
        max_retries: 0,
        cache_enabled: false,
        ..ClientConfig::default()
    }
}

pub fn executor_with(
    backend: Arc<dyn InferenceBackend>,
    store: Arc<dyn StateStore>,
    recovery: RecoveryEngine,
    settings: ExecutorSettings,
) -> CrewExecutor {
    CrewExecutor::new(
        Arc::new(InferenceClient::new(backend, client_config())),
        default_registry(),
        store,
        recovery,
        settings,
    )
}

pub fn executor(backend: Arc<dyn InferenceBackend>) -> (CrewExecutor, Arc<dyn StateStore>) {
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::default());
    let executor = executor_with(
        backend,
        store.clone(),
        RecoveryEngine::default(),
        ExecutorSettings::default(),
    );
    (executor, store)
}
