//! 错误分类器
//!
//! 纯函数：按错误变体给出类别与严重度，不解析消息文本。

use serde::{Deserialize, Serialize};

use crate::core::CrewError;
use crate::llm::InferenceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    RateLimited,
    Authentication,
    InvalidResponse,
    ModelUnavailable,
    QuotaExceeded,
    Systemic,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::RateLimited => "rate_limited",
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::InvalidResponse => "invalid_response",
            ErrorCategory::ModelUnavailable => "model_unavailable",
            ErrorCategory::QuotaExceeded => "quota_exceeded",
            ErrorCategory::Systemic => "systemic",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub category: ErrorCategory,
    pub severity: Severity,
    /// 熔断或预算耗尽：跳过其余策略直接降级
    pub short_circuit: bool,
}

impl Classification {
    fn new(category: ErrorCategory, severity: Severity) -> Self {
        Self {
            category,
            severity,
            short_circuit: false,
        }
    }

    fn short_circuit(mut self) -> Self {
        self.short_circuit = true;
        self
    }
}

pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn classify(error: &CrewError) -> Classification {
        use ErrorCategory::*;
        match error {
            CrewError::Inference(e) => Self::classify_inference(e),
            CrewError::Authentication(_) => Classification::new(Authentication, Severity::Critical),
            CrewError::Structural(_) => Classification::new(Systemic, Severity::Critical),
            CrewError::DataQuality(_) => Classification::new(InvalidResponse, Severity::Low),
            CrewError::State(_) => Classification::new(Systemic, Severity::High),
            CrewError::Systemic(_) => Classification::new(Systemic, Severity::Critical),
            CrewError::BudgetExceeded(_) => {
                Classification::new(Systemic, Severity::High).short_circuit()
            }
            CrewError::Tool { .. } | CrewError::Cancelled => {
                Classification::new(Network, Severity::Medium)
            }
        }
    }

    pub fn classify_inference(error: &InferenceError) -> Classification {
        use ErrorCategory::*;
        match error {
            InferenceError::Network(_) | InferenceError::Timeout(_) => {
                Classification::new(Network, Severity::Medium)
            }
            InferenceError::RateLimited { .. } => Classification::new(RateLimited, Severity::Medium),
            InferenceError::Authentication { .. } => {
                Classification::new(Authentication, Severity::Critical)
            }
            InferenceError::QuotaExceeded(_) => Classification::new(QuotaExceeded, Severity::High),
            InferenceError::ModelUnavailable { .. } => {
                Classification::new(ModelUnavailable, Severity::High)
            }
            InferenceError::InvalidResponse(_) => {
                Classification::new(InvalidResponse, Severity::Low)
            }
            // 请求形状被拒（过长、参数非法），简化请求可能有效
            InferenceError::Http { status: 400 | 413 | 422, .. } => {
                Classification::new(InvalidResponse, Severity::Medium)
            }
            InferenceError::CircuitOpen { .. } => {
                Classification::new(ModelUnavailable, Severity::High).short_circuit()
            }
            InferenceError::Http { .. } | InferenceError::Cancelled => {
                Classification::new(Network, Severity::Medium)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_authentication_is_always_critical() {
        let c = ErrorClassifier::classify(&CrewError::from(InferenceError::Authentication {
            status: 401,
        }));
        assert_eq!(c.category, ErrorCategory::Authentication);
        assert_eq!(c.severity, Severity::Critical);
    }

    #[test]
    fn test_unclassifiable_defaults_to_network_medium() {
        let c = ErrorClassifier::classify_inference(&InferenceError::Http {
            status: 418,
            message: "teapot".into(),
        });
        assert_eq!(c.category, ErrorCategory::Network);
        assert_eq!(c.severity, Severity::Medium);

        let c = ErrorClassifier::classify(&CrewError::Tool {
            tool: "scanner".into(),
            message: "boom".into(),
        });
        assert_eq!(c.category, ErrorCategory::Network);
    }

    #[test]
    fn test_circuit_open_short_circuits() {
        let c = ErrorClassifier::classify_inference(&InferenceError::CircuitOpen {
            endpoint: "e".into(),
        });
        assert!(c.short_circuit);
        assert_eq!(c.category, ErrorCategory::ModelUnavailable);
    }

    #[test]
    fn test_rate_limit_and_quota() {
        let c = ErrorClassifier::classify_inference(&InferenceError::RateLimited {
            retry_after: Some(Duration::from_secs(1)),
        });
        assert_eq!(c.category, ErrorCategory::RateLimited);
        let c = ErrorClassifier::classify_inference(&InferenceError::QuotaExceeded("x".into()));
        assert_eq!(c.category, ErrorCategory::QuotaExceeded);
        assert_eq!(c.severity, Severity::High);
    }
}
