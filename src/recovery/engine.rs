//! 错误恢复引擎
//!
//! 根据分类结果选择策略并依次执行；成功的策略给出带置信度折扣的输出，
//! 认证类错误与结构性错误直接上抛，不做任何恢复。

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{
    Classification, ErrorCategory, ErrorClassifier, RecoveryPolicy, RecoveryStrategy,
    StrategyOutcome, DEGRADED_CONFIDENCE_CEILING,
};
use crate::config::RecoverySection;
use crate::core::CrewError;

/// 可恢复的任务：由执行器实现，引擎通过它重跑、查缓存或调用规则兜底
#[async_trait]
pub trait RecoverableTask: Send + Sync {
    fn task_id(&self) -> &str;

    /// 重新执行，返回 (输出, 基础置信度)
    async fn retry(&self, simplified: bool) -> Result<(Value, f64), CrewError>;

    /// 之前成功执行留下的输出
    async fn cached_output(&self) -> Option<(Value, f64)>;

    /// 规则兜底（不调用推理服务）
    fn rule_based(&self) -> Option<Value>;
}

#[derive(Debug, Clone)]
pub struct RecoverySettings {
    pub max_task_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub retry_discount: f64,
    pub cache_discount: f64,
    pub simplified_discount: f64,
    pub rule_based_confidence: f64,
    pub degraded_confidence: f64,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self::from(&RecoverySection::default())
    }
}

impl From<&RecoverySection> for RecoverySettings {
    fn from(s: &RecoverySection) -> Self {
        Self {
            max_task_retries: s.max_task_retries,
            base_delay: Duration::from_millis(s.retry_base_delay_ms),
            max_delay: Duration::from_millis(s.retry_max_delay_ms),
            retry_discount: s.retry_discount,
            cache_discount: s.cache_discount,
            simplified_discount: s.simplified_discount,
            rule_based_confidence: s.rule_based_confidence,
            degraded_confidence: s.degraded_confidence.min(DEGRADED_CONFIDENCE_CEILING),
        }
    }
}

impl RecoverySettings {
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// 恢复结果
#[derive(Debug, Clone)]
pub enum RecoveryResult {
    Recovered {
        outcome: StrategyOutcome,
        classification: Classification,
        tried: Vec<RecoveryStrategy>,
    },
    Exhausted {
        error: CrewError,
        classification: Classification,
        tried: Vec<RecoveryStrategy>,
    },
    /// 不可恢复，需同步抛给调用方
    Propagate(CrewError),
}

enum Applied {
    Success(StrategyOutcome),
    /// 策略失败；Some 时带来新的错误
    Failed(Option<CrewError>),
    /// 重试途中遇到熔断，剩余策略作废
    ShortCircuit(CrewError),
}

fn must_propagate(error: &CrewError) -> bool {
    error.propagates()
        || ErrorClassifier::classify(error).category == ErrorCategory::Authentication
}

#[derive(Debug, Clone, Default)]
pub struct RecoveryEngine {
    policy: RecoveryPolicy,
    settings: RecoverySettings,
}

impl RecoveryEngine {
    pub fn new(policy: RecoveryPolicy, settings: RecoverySettings) -> Self {
        Self { policy, settings }
    }

    pub fn from_config(section: &RecoverySection) -> Self {
        Self::new(
            RecoveryPolicy::new(section.enable_degraded),
            RecoverySettings::from(section),
        )
    }

    pub fn settings(&self) -> &RecoverySettings {
        &self.settings
    }

    pub async fn recover(&self, task: &dyn RecoverableTask, error: CrewError) -> RecoveryResult {
        if must_propagate(&error) {
            return RecoveryResult::Propagate(error);
        }
        let classification = ErrorClassifier::classify(&error);
        if classification.category == ErrorCategory::Systemic {
            tracing::error!(task_id = %task.task_id(), error = %error, "systemic fault in task");
        }

        let mut queue: VecDeque<RecoveryStrategy> = self.policy.plan(&classification).into();
        let mut tried = Vec::with_capacity(queue.len());
        let mut last_error = error;

        while let Some(strategy) = queue.pop_front() {
            tried.push(strategy);
            match self.apply(strategy, task, &last_error).await {
                Applied::Success(outcome) => {
                    tracing::info!(
                        task_id = %task.task_id(),
                        strategy = %strategy,
                        confidence = outcome.confidence,
                        "task recovered"
                    );
                    return RecoveryResult::Recovered {
                        outcome,
                        classification,
                        tried,
                    };
                }
                Applied::Failed(Some(e)) if must_propagate(&e) => {
                    return RecoveryResult::Propagate(e);
                }
                Applied::ShortCircuit(e) => {
                    let tripped = ErrorClassifier::classify(&e);
                    tracing::warn!(
                        task_id = %task.task_id(),
                        strategy = %strategy,
                        error = %e,
                        "circuit opened during recovery, skipping remaining strategies"
                    );
                    queue = self.policy.plan(&tripped).into();
                    last_error = e;
                }
                Applied::Failed(next) => {
                    tracing::warn!(
                        task_id = %task.task_id(),
                        strategy = %strategy,
                        category = %classification.category,
                        "recovery strategy did not succeed"
                    );
                    if let Some(e) = next {
                        last_error = e;
                    }
                }
            }
        }

        RecoveryResult::Exhausted {
            error: last_error,
            classification,
            tried,
        }
    }

    async fn apply(&self, strategy: RecoveryStrategy, task: &dyn RecoverableTask, error: &CrewError) -> Applied {
        let s = &self.settings;
        let outcome = |data: Value, confidence: f64| {
            Applied::Success(StrategyOutcome {
                strategy,
                success: true,
                data,
                confidence: confidence.clamp(0.0, 1.0),
            })
        };

        match strategy {
            RecoveryStrategy::RetryWithBackoff => {
                let mut last = error.clone();
                for attempt in 1..=s.max_task_retries {
                    let delay = last.retry_after().unwrap_or_else(|| s.backoff(attempt));
                    tracing::debug!(task_id = %task.task_id(), attempt, delay_ms = delay.as_millis() as u64, "retrying task");
                    tokio::time::sleep(delay).await;
                    match task.retry(false).await {
                        Ok((data, confidence)) => return outcome(data, confidence * s.retry_discount),
                        Err(e) if must_propagate(&e) => return Applied::Failed(Some(e)),
                        Err(e) if ErrorClassifier::classify(&e).short_circuit => {
                            return Applied::ShortCircuit(e)
                        }
                        Err(e) => last = e,
                    }
                }
                Applied::Failed(Some(last))
            }
            RecoveryStrategy::UseCache => match task.cached_output().await {
                Some((data, confidence)) => outcome(data, confidence * s.cache_discount),
                None => Applied::Failed(None),
            },
            RecoveryStrategy::SimplifiedRequest => match task.retry(true).await {
                Ok((data, confidence)) => outcome(data, confidence * s.simplified_discount),
                Err(e) => Applied::Failed(Some(e)),
            },
            RecoveryStrategy::RuleBasedFallback => match task.rule_based() {
                Some(data) => outcome(data, s.rule_based_confidence),
                None => Applied::Failed(None),
            },
            RecoveryStrategy::DegradedService => outcome(
                Self::degraded_placeholder(task.task_id(), error),
                s.degraded_confidence.min(DEGRADED_CONFIDENCE_CEILING),
            ),
        }
    }

    /// 最小化、带标记的占位输出
    pub fn degraded_placeholder(task_id: &str, error: &CrewError) -> Value {
        json!({
            "degraded": true,
            "task_id": task_id,
            "reason": error.to_string(),
            "result": Value::Null,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::InferenceError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedTask {
        results: Mutex<Vec<Result<(Value, f64), CrewError>>>,
        cached: Option<(Value, f64)>,
        rule: Option<Value>,
        retries: AtomicUsize,
    }

    impl ScriptedTask {
        fn new(results: Vec<Result<(Value, f64), CrewError>>) -> Self {
            Self {
                results: Mutex::new(results),
                cached: None,
                rule: None,
                retries: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl RecoverableTask for ScriptedTask {
        fn task_id(&self) -> &str {
            "t"
        }

        async fn retry(&self, _simplified: bool) -> Result<(Value, f64), CrewError> {
            self.retries.fetch_add(1, Ordering::SeqCst);
            let mut results = self.results.lock().unwrap();
            if results.is_empty() {
                Err(CrewError::Inference(InferenceError::Network("down".into())))
            } else {
                results.remove(0)
            }
        }

        async fn cached_output(&self) -> Option<(Value, f64)> {
            self.cached.clone()
        }

        fn rule_based(&self) -> Option<Value> {
            self.rule.clone()
        }
    }

    fn network() -> CrewError {
        CrewError::Inference(InferenceError::Network("reset".into()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_with_discount() {
        let engine = RecoveryEngine::default();
        let task = ScriptedTask::new(vec![Err(network()), Ok((json!({"ok": true}), 1.0))]);
        match engine.recover(&task, network()).await {
            RecoveryResult::Recovered { outcome, tried, .. } => {
                assert_eq!(outcome.strategy, RecoveryStrategy::RetryWithBackoff);
                assert!((outcome.confidence - 0.9).abs() < 1e-9);
                assert_eq!(tried, vec![RecoveryStrategy::RetryWithBackoff]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(task.retries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_falls_through_to_cache_then_rule() {
        let engine = RecoveryEngine::default();
        let mut task = ScriptedTask::new(vec![]);
        task.rule = Some(json!({"strategy": "Big Bang"}));
        match engine.recover(&task, network()).await {
            RecoveryResult::Recovered { outcome, tried, .. } => {
                assert_eq!(outcome.strategy, RecoveryStrategy::RuleBasedFallback);
                assert_eq!(outcome.confidence, 0.5);
                assert_eq!(tried.len(), 3);
            }
            other => panic!("unexpected {other:?}"),
        }

        let mut task = ScriptedTask::new(vec![]);
        task.cached = Some((json!("old"), 0.8));
        match engine.recover(&task, network()).await {
            RecoveryResult::Recovered { outcome, .. } => {
                assert_eq!(outcome.strategy, RecoveryStrategy::UseCache);
                assert!((outcome.confidence - 0.56).abs() < 1e-9);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_is_last_resort() {
        let engine = RecoveryEngine::default();
        let task = ScriptedTask::new(vec![]);
        match engine.recover(&task, network()).await {
            RecoveryResult::Recovered { outcome, .. } => {
                assert_eq!(outcome.strategy, RecoveryStrategy::DegradedService);
                assert!(outcome.confidence <= 0.3);
                assert_eq!(outcome.data["degraded"], true);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_authentication_propagates_without_retry() {
        let engine = RecoveryEngine::default();
        let task = ScriptedTask::new(vec![]);
        let err = CrewError::from(InferenceError::Authentication { status: 401 });
        assert!(matches!(
            engine.recover(&task, err).await,
            RecoveryResult::Propagate(CrewError::Authentication(_))
        ));
        assert_eq!(task.retries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_exhausted_without_degraded() {
        let section = RecoverySection {
            enable_degraded: false,
            ..RecoverySection::default()
        };
        let engine = RecoveryEngine::from_config(&section);
        let task = ScriptedTask::new(vec![]);
        let err = CrewError::Systemic("boom".into());
        match engine.recover(&task, err).await {
            RecoveryResult::Exhausted { tried, classification, .. } => {
                assert!(tried.is_empty());
                assert_eq!(classification.category, ErrorCategory::Systemic);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_open_during_retry_goes_straight_to_degraded() {
        let engine = RecoveryEngine::default();
        let mut task = ScriptedTask::new(vec![
            Err(CrewError::from(InferenceError::CircuitOpen {
                endpoint: "test://model".into(),
            })),
            Ok((json!("late"), 1.0)),
        ]);
        task.cached = Some((json!("old"), 0.8));
        task.rule = Some(json!("rule"));
        match engine.recover(&task, network()).await {
            RecoveryResult::Recovered { outcome, tried, .. } => {
                assert_eq!(outcome.strategy, RecoveryStrategy::DegradedService);
                assert_eq!(
                    tried,
                    vec![RecoveryStrategy::RetryWithBackoff, RecoveryStrategy::DegradedService]
                );
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(task.retries.load(Ordering::SeqCst), 1);

        let strict = RecoveryEngine::new(RecoveryPolicy::new(false), RecoverySettings::default());
        let task = ScriptedTask::new(vec![Err(CrewError::from(InferenceError::CircuitOpen {
            endpoint: "test://model".into(),
        }))]);
        match strict.recover(&task, network()).await {
            RecoveryResult::Exhausted { error, tried, .. } => {
                assert!(matches!(error, CrewError::Inference(InferenceError::CircuitOpen { .. })));
                assert_eq!(tried, vec![RecoveryStrategy::RetryWithBackoff]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
