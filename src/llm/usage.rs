//! 用量与成本统计
//!
//! 每次完成的调用（含缓存命中）记录一条 UsageRecord；累计值用原子计数，明细保留最近 N 条。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Usage;

/// 每 1K token 单价
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    pub prompt_per_1k: f64,
    pub completion_per_1k: f64,
}

impl Default for Pricing {
    fn default() -> Self {
        Self {
            prompt_per_1k: 0.00015,
            completion_per_1k: 0.0006,
        }
    }
}

impl Pricing {
    pub fn cost(&self, usage: &Usage) -> f64 {
        usage.prompt_tokens as f64 / 1000.0 * self.prompt_per_1k
            + usage.completion_tokens as f64 / 1000.0 * self.completion_per_1k
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost: f64,
    pub context_id: Option<String>,
    pub model: String,
    pub cache_hit: bool,
    pub timestamp: DateTime<Utc>,
}

pub struct UsageMonitor {
    records: RwLock<VecDeque<UsageRecord>>,
    max_records: usize,
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
    calls: AtomicU64,
    cache_hits: AtomicU64,
    /// 成本以 1e-9 为单位累计，避免浮点原子
    cost_nanos: AtomicU64,
}

impl Default for UsageMonitor {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl UsageMonitor {
    pub fn new(max_records: usize) -> Self {
        Self {
            records: RwLock::new(VecDeque::new()),
            max_records: max_records.max(1),
            prompt_tokens: AtomicU64::new(0),
            completion_tokens: AtomicU64::new(0),
            calls: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cost_nanos: AtomicU64::new(0),
        }
    }

    pub fn record(&self, record: UsageRecord) {
        self.prompt_tokens.fetch_add(record.prompt_tokens, Ordering::Relaxed);
        self.completion_tokens
            .fetch_add(record.completion_tokens, Ordering::Relaxed);
        self.calls.fetch_add(1, Ordering::Relaxed);
        if record.cache_hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        }
        self.cost_nanos
            .fetch_add((record.cost * 1e9).round() as u64, Ordering::Relaxed);

        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        if records.len() >= self.max_records {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// (prompt_tokens, completion_tokens, total_tokens)
    pub fn totals(&self) -> (u64, u64, u64) {
        let p = self.prompt_tokens.load(Ordering::Relaxed);
        let c = self.completion_tokens.load(Ordering::Relaxed);
        (p, c, p + c)
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn total_cost(&self) -> f64 {
        self.cost_nanos.load(Ordering::Relaxed) as f64 / 1e9
    }

    pub fn records(&self) -> Vec<UsageRecord> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn records_for(&self, context_id: &str) -> Vec<UsageRecord> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| r.context_id.as_deref() == Some(context_id))
            .cloned()
            .collect()
    }
}
