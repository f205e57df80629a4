//! 错误分类与恢复：分类器、策略选择、熔断器、恢复引擎

pub mod circuit_breaker;
pub mod classifier;
pub mod engine;
pub mod strategy;

pub use circuit_breaker::{Admission, CircuitBreaker, CircuitState};
pub use classifier::{Classification, ErrorCategory, ErrorClassifier, Severity};
pub use engine::{RecoverableTask, RecoveryEngine, RecoveryResult, RecoverySettings};
pub use strategy::{RecoveryPolicy, RecoveryStrategy, StrategyOutcome, DEGRADED_CONFIDENCE_CEILING};
