//! 恢复策略与选择规则
//!
//! 策略按顺序尝试，直到某个成功或列表耗尽。degraded_service 总是成功，但置信度不超过 0.3。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Classification, ErrorCategory};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    RetryWithBackoff,
    UseCache,
    SimplifiedRequest,
    RuleBasedFallback,
    DegradedService,
}

impl RecoveryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryStrategy::RetryWithBackoff => "retry_with_backoff",
            RecoveryStrategy::UseCache => "use_cache",
            RecoveryStrategy::SimplifiedRequest => "simplified_request",
            RecoveryStrategy::RuleBasedFallback => "rule_based_fallback",
            RecoveryStrategy::DegradedService => "degraded_service",
        }
    }
}

impl std::fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单个策略的执行结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyOutcome {
    pub strategy: RecoveryStrategy,
    pub success: bool,
    pub data: Value,
    pub confidence: f64,
}

/// 降级结果的置信度上限
pub const DEGRADED_CONFIDENCE_CEILING: f64 = 0.3;

#[derive(Debug, Clone)]
pub struct RecoveryPolicy {
    enable_degraded: bool,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            enable_degraded: true,
        }
    }
}

impl RecoveryPolicy {
    pub fn new(enable_degraded: bool) -> Self {
        Self { enable_degraded }
    }

    /// 按类别给出有序策略
    pub fn select_strategies(&self, category: ErrorCategory) -> Vec<RecoveryStrategy> {
        use RecoveryStrategy::*;
        let mut strategies = match category {
            ErrorCategory::Network | ErrorCategory::RateLimited => {
                vec![RetryWithBackoff, UseCache, RuleBasedFallback, DegradedService]
            }
            ErrorCategory::InvalidResponse => vec![
                SimplifiedRequest,
                RetryWithBackoff,
                RuleBasedFallback,
                DegradedService,
            ],
            ErrorCategory::ModelUnavailable | ErrorCategory::QuotaExceeded => {
                vec![UseCache, RuleBasedFallback, DegradedService]
            }
            ErrorCategory::Systemic => vec![DegradedService],
            ErrorCategory::Authentication => Vec::new(),
        };
        if !self.enable_degraded {
            strategies.retain(|s| *s != DegradedService);
        }
        strategies
    }

    /// 熔断 / 预算耗尽时只走降级
    pub fn plan(&self, classification: &Classification) -> Vec<RecoveryStrategy> {
        if classification.short_circuit {
            return if self.enable_degraded {
                vec![RecoveryStrategy::DegradedService]
            } else {
                Vec::new()
            };
        }
        self.select_strategies(classification.category)
    }
}
