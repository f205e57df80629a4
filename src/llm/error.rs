//! 推理层错误类型
//!
//! 按上游状态码与传输失败分类；调用方按变体匹配，不解析消息文本。

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InferenceError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Authentication rejected (status {status})")]
    Authentication { status: u16 },

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Model unavailable (status {status}): {message}")]
    ModelUnavailable { status: u16, message: String },

    #[error("Upstream HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Circuit open for endpoint {endpoint}")]
    CircuitOpen { endpoint: String },

    #[error("Request cancelled")]
    Cancelled,
}

impl InferenceError {
    /// 由非 2xx 状态码构造
    pub fn from_status(status: u16, body: String, retry_after: Option<Duration>) -> Self {
        match status {
            401 | 403 => InferenceError::Authentication { status },
            402 => InferenceError::QuotaExceeded(body),
            429 => InferenceError::RateLimited { retry_after },
            404 | 502 | 503 => InferenceError::ModelUnavailable {
                status,
                message: body,
            },
            _ => InferenceError::Http {
                status,
                message: body,
            },
        }
    }

    /// 客户端内部是否应重试：429、传输失败、5xx
    pub fn is_retryable(&self) -> bool {
        match self {
            InferenceError::Network(_)
            | InferenceError::Timeout(_)
            | InferenceError::RateLimited { .. } => true,
            InferenceError::Http { status, .. } | InferenceError::ModelUnavailable { status, .. } => {
                *status >= 500
            }
            _ => false,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            InferenceError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            InferenceError::Authentication { status }
            | InferenceError::ModelUnavailable { status, .. }
            | InferenceError::Http { status, .. } => Some(*status),
            InferenceError::RateLimited { .. } => Some(429),
            InferenceError::QuotaExceeded(_) => Some(402),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            InferenceError::from_status(401, String::new(), None),
            InferenceError::Authentication { status: 401 }
        );
        assert!(matches!(
            InferenceError::from_status(429, String::new(), Some(Duration::from_secs(2))),
            InferenceError::RateLimited { retry_after: Some(d) } if d == Duration::from_secs(2)
        ));
        assert!(matches!(
            InferenceError::from_status(503, "down".into(), None),
            InferenceError::ModelUnavailable { status: 503, .. }
        ));
    }

    #[test]
    fn test_only_transient_errors_are_retryable() {
        assert!(InferenceError::RateLimited { retry_after: None }.is_retryable());
        assert!(InferenceError::Network("reset".into()).is_retryable());
        assert!(InferenceError::from_status(500, String::new(), None).is_retryable());
        assert!(!InferenceError::from_status(400, String::new(), None).is_retryable());
        assert!(!InferenceError::from_status(404, String::new(), None).is_retryable());
        assert!(!InferenceError::Authentication { status: 401 }.is_retryable());
        assert!(!InferenceError::InvalidResponse("x".into()).is_retryable());
    }
}
