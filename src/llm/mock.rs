//! Mock 推理后端（用于测试，无需 API）
//!
//! 默认回显最后一条 User 消息；可预置响应队列或注入处理闭包，并记录调用次数与请求内容。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::budget::TokenEstimator;
use super::{InferenceBackend, InferenceError, InferenceRequest, InferenceResponse, Role, Usage};

type Handler =
    dyn Fn(&InferenceRequest) -> Result<InferenceResponse, InferenceError> + Send + Sync;

/// 可编排的 Mock 后端：队列优先，其次 handler，最后回显
pub struct MockBackend {
    endpoint: String,
    model: String,
    script: Mutex<VecDeque<Result<InferenceResponse, InferenceError>>>,
    handler: Option<Arc<Handler>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    requests: Mutex<Vec<InferenceRequest>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            endpoint: "mock://inference".to_string(),
            model: "mock-model".to_string(),
            script: Mutex::new(VecDeque::new()),
            handler: None,
            delay: None,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&InferenceRequest) -> Result<InferenceResponse, InferenceError> + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// 每次调用前等待（配合 tokio 暂停时钟测试超时与取消）
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push_response(&self, response: InferenceResponse) {
        self.lock_script().push_back(Ok(response));
    }

    pub fn push_text(&self, content: impl Into<String>) {
        let response = Self::text_response(&self.model, content);
        self.push_response(response);
    }

    pub fn push_error(&self, error: InferenceError) {
        self.lock_script().push_back(Err(error));
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<InferenceRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// 构造文本响应，token 数按估算器计算
    pub fn text_response(model: &str, content: impl Into<String>) -> InferenceResponse {
        let content = content.into();
        InferenceResponse {
            id: format!("mock_{}", uuid::Uuid::new_v4()),
            model: model.to_string(),
            usage: Usage {
                prompt_tokens: 0,
                completion_tokens: TokenEstimator::estimate(&content) as u64,
            },
            content,
            tool_calls: Vec::new(),
            finish_reason: Some("stop".to_string()),
            metadata: Default::default(),
        }
    }

    fn lock_script(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<InferenceResponse, InferenceError>>> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn echo(&self, request: &InferenceRequest) -> InferenceResponse {
        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        let mut response = Self::text_response(
            request.model.as_deref().unwrap_or(&self.model),
            format!("Echo from Mock: {}", last_user),
        );
        response.usage.prompt_tokens = TokenEstimator::estimate_messages(&request.messages) as u64;
        response
    }
}

#[async_trait]
impl InferenceBackend for MockBackend {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    async fn send(&self, request: &InferenceRequest) -> Result<InferenceResponse, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.lock_script().pop_front();
        match scripted {
            Some(result) => result,
            None => match &self.handler {
                Some(handler) => handler(request),
                None => Ok(self.echo(request)),
            },
        }
    }
}
