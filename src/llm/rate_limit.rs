//! 每分钟请求数限制（滑动窗口）
//!
//! 超出上限时等待窗口滑出，而不是报错。按作用域键（组织 / 关联 id）分别计数。

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

pub struct RateLimiter {
    per_minute: u32,
    window: Duration,
    buckets: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    /// per_minute 为 0 表示不限
    pub fn per_minute(per_minute: u32) -> Self {
        Self {
            per_minute,
            window: Duration::from_secs(60),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.per_minute == 0
    }

    /// 取得一个配额；不足时休眠到最早一次请求滑出窗口
    pub async fn acquire(&self, key: &str) {
        loop {
            match self.try_reserve(key) {
                None => return,
                Some(wait) => {
                    tracing::debug!(key = %key, wait_ms = wait.as_millis() as u64, "rate limit reached, waiting");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// 立即尝试；成功返回 true
    pub fn try_acquire(&self, key: &str) -> bool {
        self.try_reserve(key).is_none()
    }

    /// 成功预留返回 None，否则返回需要等待的时长
    fn try_reserve(&self, key: &str) -> Option<Duration> {
        if self.is_unlimited() {
            return None;
        }
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = buckets.entry(key.to_string()).or_default();
        while let Some(front) = bucket.front() {
            if now.duration_since(*front) >= self.window {
                bucket.pop_front();
            } else {
                break;
            }
        }
        if (bucket.len() as u32) < self.per_minute {
            bucket.push_back(now);
            return None;
        }
        bucket
            .front()
            .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
            .map(|d| d.max(Duration::from_millis(1)))
    }
}
