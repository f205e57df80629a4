//! 熔断器
//!
//! 按 (错误类别, 端点) 计连续失败；达到阈值后 Open，冷却期内直接拒绝；
//! 冷却结束进入 HalfOpen，只放行一次试探调用：成功则关闭，失败则重新打开并重置冷却。
//! 跨运行共享，临界区很短，不跨 await。

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use super::ErrorCategory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open { since: Instant },
    /// 试探调用开始时间；超过冷却期未回报视为丢失，允许新的试探
    HalfOpen { trial_started: Instant },
}

/// 准入结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// 半开状态下的唯一试探
    Trial,
    Rejected,
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    consecutive_failures: u32,
}

impl Default for Circuit {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
        }
    }
}

pub struct CircuitBreaker {
    circuits: Mutex<HashMap<(ErrorCategory, String), Circuit>>,
    failure_threshold: u32,
    cooldown: Duration,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(30))
    }
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            circuits: Mutex::new(HashMap::new()),
            failure_threshold: failure_threshold.max(1),
            cooldown,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(ErrorCategory, String), Circuit>> {
        self.circuits.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 调用前检查端点是否可用；任一类别的电路在冷却期内即拒绝
    pub fn admit(&self, endpoint: &str) -> Admission {
        let now = Instant::now();
        let mut circuits = self.lock();
        let mut trial = false;
        for (_, circuit) in circuits.iter().filter(|((_, ep), _)| ep == endpoint) {
            match circuit.state {
                CircuitState::Closed => {}
                CircuitState::Open { since } if now.duration_since(since) >= self.cooldown => {
                    trial = true
                }
                CircuitState::HalfOpen { trial_started }
                    if now.duration_since(trial_started) >= self.cooldown =>
                {
                    trial = true
                }
                _ => return Admission::Rejected,
            }
        }
        if !trial {
            return Admission::Allowed;
        }
        for (_, circuit) in circuits.iter_mut().filter(|((_, ep), _)| ep == endpoint) {
            if circuit.state != CircuitState::Closed {
                circuit.state = CircuitState::HalfOpen { trial_started: now };
            }
        }
        tracing::info!(endpoint = %endpoint, "circuit half-open, admitting trial call");
        Admission::Trial
    }

    /// 成功：该端点所有电路关闭并清零
    pub fn record_success(&self, endpoint: &str) {
        let mut circuits = self.lock();
        for ((_, ep), circuit) in circuits.iter_mut().filter(|((_, ep), _)| ep == endpoint) {
            if circuit.state != CircuitState::Closed {
                tracing::info!(endpoint = %ep, "circuit closed after successful call");
            }
            circuit.state = CircuitState::Closed;
            circuit.consecutive_failures = 0;
        }
    }

    pub fn record_failure(&self, category: ErrorCategory, endpoint: &str) {
        let now = Instant::now();
        let mut circuits = self.lock();
        let circuit = circuits
            .entry((category, endpoint.to_string()))
            .or_default();
        circuit.consecutive_failures += 1;
        match circuit.state {
            CircuitState::HalfOpen { .. } => {
                circuit.state = CircuitState::Open { since: now };
                tracing::warn!(endpoint = %endpoint, category = %category, "trial call failed, circuit reopened");
            }
            CircuitState::Closed if circuit.consecutive_failures >= self.failure_threshold => {
                circuit.state = CircuitState::Open { since: now };
                tracing::warn!(
                    endpoint = %endpoint,
                    category = %category,
                    failures = circuit.consecutive_failures,
                    "circuit opened"
                );
            }
            _ => {}
        }
    }

    pub fn state(&self, category: ErrorCategory, endpoint: &str) -> CircuitState {
        self.lock()
            .get(&(category, endpoint.to_string()))
            .map(|c| c.state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn is_open(&self, endpoint: &str) -> bool {
        self.lock()
            .iter()
            .any(|((_, ep), c)| ep == endpoint && !matches!(c.state, CircuitState::Closed))
    }
}
