//! 推理客户端：与远端推理服务的唯一接触点
//!
//! 一次 complete 的处理顺序：
//! 1. 缓存命中直接返回（cache_hit = true，成本记 0）
//! 2. 熔断器准入；打开时返回 CircuitOpen，不触网
//! 3. Token 预算裁剪
//! 4. 作用域限流（等待而非失败）
//! 5. 信号量限制并发，单次调用硬超时
//! 6. 429 / 传输失败 / 5xx 指数退避重试，Retry-After 优先
//! 7. 记录熔断结果、写缓存、记录用量、输出审计日志

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures_util::{stream, StreamExt};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use super::budget::TokenBudgetOptimizer;
use super::cache::{cache_key, ResponseCache};
use super::rate_limit::RateLimiter;
use super::traits::ChunkStream;
use super::usage::{Pricing, UsageMonitor, UsageRecord};
use super::{
    InferenceBackend, InferenceChunk, InferenceError, InferenceRequest, InferenceResponse, Message,
    Usage,
};
use crate::config::AppConfig;
use crate::recovery::{Admission, CircuitBreaker, ErrorClassifier};

/// 客户端参数
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub max_concurrent_requests: usize,
    pub request_timeout: Duration,
    /// 首次尝试之外的最大重试次数
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_prompt_tokens: usize,
    /// 全局每分钟请求数，0 表示不限
    pub requests_per_minute: u32,
    pub cache_enabled: bool,
    pub pricing: Pricing,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 8,
            request_timeout: Duration::from_secs(60),
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_prompt_tokens: 6_000,
            requests_per_minute: 0,
            cache_enabled: true,
            pricing: Pricing::default(),
        }
    }
}

impl ClientConfig {
    pub fn from_app_config(cfg: &AppConfig) -> Self {
        Self {
            max_concurrent_requests: cfg.llm.max_concurrent_requests.max(1),
            request_timeout: cfg.llm.request_timeout(),
            max_retries: cfg.llm.max_retries,
            base_delay: Duration::from_millis(cfg.llm.base_delay_ms),
            max_delay: Duration::from_millis(cfg.llm.max_delay_ms),
            max_prompt_tokens: cfg.llm.max_prompt_tokens,
            requests_per_minute: cfg.llm.requests_per_minute,
            cache_enabled: cfg.cache.enabled,
            pricing: Pricing {
                prompt_per_1k: cfg.llm.prompt_cost_per_1k,
                completion_per_1k: cfg.llm.completion_cost_per_1k,
            },
        }
    }

    /// 第 attempt 次失败后的退避：base * 2^(attempt-1)，上限 max_delay
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

pub struct InferenceClient {
    backend: Arc<dyn InferenceBackend>,
    config: ClientConfig,
    semaphore: Arc<Semaphore>,
    cache: Arc<ResponseCache>,
    breaker: Arc<CircuitBreaker>,
    usage: Arc<UsageMonitor>,
    limiter: RateLimiter,
    optimizer: TokenBudgetOptimizer,
}

impl InferenceClient {
    pub fn new(backend: Arc<dyn InferenceBackend>, config: ClientConfig) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_requests.max(1))),
            limiter: RateLimiter::per_minute(config.requests_per_minute),
            optimizer: TokenBudgetOptimizer::new(config.max_prompt_tokens),
            cache: Arc::new(ResponseCache::default()),
            breaker: Arc::new(CircuitBreaker::default()),
            usage: Arc::new(UsageMonitor::default()),
            backend,
            config,
        }
    }

    pub fn with_cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_usage_monitor(mut self, usage: Arc<UsageMonitor>) -> Self {
        self.usage = usage;
        self
    }

    pub fn endpoint(&self) -> &str {
        self.backend.endpoint()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn usage(&self) -> &Arc<UsageMonitor> {
        &self.usage
    }

    /// 补全默认模型并返回缓存键（未启用缓存时为 None）
    fn prepare(&self, request: &mut InferenceRequest) -> Option<String> {
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.backend.default_model().to_string());
        request.model = Some(model.clone());
        (self.config.cache_enabled && request.use_cache).then(|| cache_key(request, &model))
    }

    fn cached(&self, key: Option<&str>, request: &InferenceRequest) -> Option<InferenceResponse> {
        let mut response = self.cache.get(key?)?;
        response.metadata.cache_hit = true;
        self.record_usage(request, &response.model, &response.usage, true);
        Some(response)
    }

    fn admit(&self) -> Result<Admission, InferenceError> {
        match self.breaker.admit(self.endpoint()) {
            Admission::Rejected => {
                tracing::warn!(endpoint = %self.endpoint(), "circuit open, short-circuiting inference call");
                Err(InferenceError::CircuitOpen {
                    endpoint: self.endpoint().to_string(),
                })
            }
            admission => Ok(admission),
        }
    }

    fn trim(&self, request: &mut InferenceRequest) -> bool {
        let messages = std::mem::take(&mut request.messages);
        let (messages, report) = self.optimizer.fit(messages);
        request.messages = messages;
        if report.trimmed() {
            tracing::debug!(
                original = report.original_tokens,
                trimmed_to = report.final_tokens,
                steps = ?report.steps,
                "request trimmed to token budget"
            );
        }
        report.trimmed()
    }

    async fn throttle(&self, request: &InferenceRequest) {
        let scope = request.context_id.as_deref().unwrap_or("global");
        self.limiter.acquire(scope).await;
    }

    fn record_usage(&self, request: &InferenceRequest, model: &str, usage: &Usage, cache_hit: bool) {
        let cost = if cache_hit { 0.0 } else { self.config.pricing.cost(usage) };
        self.usage.record(UsageRecord {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            cost,
            context_id: request.context_id.clone(),
            model: model.to_string(),
            cache_hit,
            timestamp: Utc::now(),
        });
    }

    fn record_outcome<T>(&self, result: &Result<T, InferenceError>) {
        match result {
            Ok(_) => self.breaker.record_success(self.endpoint()),
            Err(InferenceError::CircuitOpen { .. }) | Err(InferenceError::Cancelled) => {}
            Err(e) => {
                let category = ErrorClassifier::classify_inference(e).category;
                self.breaker.record_failure(category, self.endpoint());
            }
        }
    }

    fn audit(&self, request: &InferenceRequest, result: &Result<InferenceResponse, InferenceError>, started: Instant) {
        let (ok, cache_hit, attempts, usage, error) = match result {
            Ok(r) => (true, r.metadata.cache_hit, r.metadata.attempts, r.usage, None),
            Err(e) => (false, false, 0, Usage::default(), Some(e.to_string())),
        };
        let audit = serde_json::json!({
            "event": "inference_audit",
            "endpoint": self.endpoint(),
            "model": request.model,
            "context_id": request.context_id,
            "cache_hit": cache_hit,
            "ok": ok,
            "attempts": attempts,
            "duration_ms": started.elapsed().as_millis() as u64,
            "prompt_tokens": usage.prompt_tokens,
            "completion_tokens": usage.completion_tokens,
            "error": error,
        });
        tracing::info!(audit = %audit.to_string(), "inference");
    }

    /// 非流式补全
    pub async fn complete(&self, mut request: InferenceRequest) -> Result<InferenceResponse, InferenceError> {
        let started = Instant::now();
        let key = self.prepare(&mut request);

        if let Some(hit) = self.cached(key.as_deref(), &request) {
            let result = Ok(hit);
            self.audit(&request, &result, started);
            return result;
        }

        let result = match self.admit() {
            Err(e) => Err(e),
            Ok(admission) => {
                let trimmed = self.trim(&mut request);
                self.throttle(&request).await;
                // 半开试探只发一次，失败立即回报熔断器
                let max_retries = match admission {
                    Admission::Trial => 0,
                    _ => self.config.max_retries,
                };
                let result = self.send_with_retry(&request, max_retries).await.map(|mut r| {
                    r.metadata.trimmed = trimmed;
                    r.metadata.endpoint = self.endpoint().to_string();
                    if r.model.is_empty() {
                        r.model = request.model.clone().unwrap_or_default();
                    }
                    r
                });
                self.record_outcome(&result);
                result
            }
        };

        if let Ok(response) = &result {
            if let Some(key) = &key {
                self.cache.insert(key, response.clone(), request.cache_strategy);
            }
            self.record_usage(&request, &response.model, &response.usage, false);
        }
        self.audit(&request, &result, started);
        result
    }

    async fn send_with_retry(
        &self,
        request: &InferenceRequest,
        max_retries: u32,
    ) -> Result<InferenceResponse, InferenceError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let outcome = {
                let _permit = self
                    .semaphore
                    .acquire()
                    .await
                    .map_err(|_| InferenceError::Cancelled)?;
                match tokio::time::timeout(self.config.request_timeout, self.backend.send(request)).await {
                    Ok(r) => r,
                    Err(_) => Err(InferenceError::Timeout(self.config.request_timeout)),
                }
            };
            match outcome {
                Ok(mut response) => {
                    response.metadata.attempts = attempt;
                    return Ok(response);
                }
                Err(e) if e.is_retryable() && attempt <= max_retries => {
                    let delay = e
                        .retry_after()
                        .unwrap_or_else(|| self.config.backoff(attempt));
                    tracing::warn!(
                        endpoint = %self.endpoint(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "inference call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// 流式补全；信号量许可随流存活，流结束后写缓存并记录用量
    pub async fn complete_streaming(&self, mut request: InferenceRequest) -> Result<ChunkStream, InferenceError> {
        let key = self.prepare(&mut request);

        if let Some(hit) = self.cached(key.as_deref(), &request) {
            let chunk = InferenceChunk {
                delta: hit.content,
                finish_reason: hit.finish_reason,
                usage: Some(hit.usage),
                cache_hit: true,
            };
            return Ok(Box::pin(stream::iter(vec![Ok(chunk)])));
        }

        self.admit()?;
        self.trim(&mut request);
        self.throttle(&request).await;

        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| InferenceError::Cancelled)?;
        let opened = match tokio::time::timeout(self.config.request_timeout, self.backend.send_stream(&request)).await {
            Ok(r) => r,
            Err(_) => Err(InferenceError::Timeout(self.config.request_timeout)),
        };
        self.record_outcome(&opened);
        let inner = opened?;

        let acc = Arc::new(Mutex::new(StreamAccumulator {
            _permit: permit,
            content: String::new(),
            finish_reason: None,
            usage: None,
            failed: false,
        }));
        let acc_in = Arc::clone(&acc);
        let body = inner.map(move |item| {
            let mut a = acc_in.lock().unwrap_or_else(|e| e.into_inner());
            match &item {
                Ok(chunk) => {
                    a.content.push_str(&chunk.delta);
                    if chunk.finish_reason.is_some() {
                        a.finish_reason = chunk.finish_reason.clone();
                    }
                    if chunk.usage.is_some() {
                        a.usage = chunk.usage;
                    }
                }
                Err(_) => a.failed = true,
            }
            item
        });

        let cache = Arc::clone(&self.cache);
        let usage_monitor = Arc::clone(&self.usage);
        let pricing = self.config.pricing;
        let model = request.model.clone().unwrap_or_default();
        let context_id = request.context_id.clone();
        let prompt_estimate = super::budget::TokenEstimator::estimate_messages(&request.messages) as u64;
        let strategy = request.cache_strategy;
        let finalize = stream::once(async move {
            let a = acc.lock().unwrap_or_else(|e| e.into_inner());
            if !a.failed {
                let usage = a.usage.unwrap_or(Usage {
                    prompt_tokens: prompt_estimate,
                    completion_tokens: super::budget::TokenEstimator::estimate(&a.content) as u64,
                });
                usage_monitor.record(UsageRecord {
                    prompt_tokens: usage.prompt_tokens,
                    completion_tokens: usage.completion_tokens,
                    cost: pricing.cost(&usage),
                    context_id,
                    model: model.clone(),
                    cache_hit: false,
                    timestamp: Utc::now(),
                });
                if let Some(key) = key {
                    let response = InferenceResponse {
                        id: format!("stream_{}", uuid::Uuid::new_v4()),
                        model,
                        content: a.content.clone(),
                        tool_calls: Vec::new(),
                        finish_reason: a.finish_reason.clone(),
                        usage,
                        metadata: Default::default(),
                    };
                    cache.insert(&key, response, strategy);
                }
            }
            None::<Result<InferenceChunk, InferenceError>>
        })
        .filter_map(|x| async move { x });

        Ok(Box::pin(body.chain(finalize)))
    }

    /// 1 token 的探活请求，绕过缓存
    pub async fn health_check(&self) -> bool {
        let request = InferenceRequest::new(vec![Message::user("ping")])
            .with_max_tokens(1)
            .without_cache();
        match self.complete(request).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(endpoint = %self.endpoint(), error = %e, "inference health check failed");
                false
            }
        }
    }
}

struct StreamAccumulator {
    _permit: OwnedSemaphorePermit,
    content: String,
    finish_reason: Option<String>,
    usage: Option<Usage>,
    failed: bool,
}
