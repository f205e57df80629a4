//! 推理响应缓存
//!
//! 键为 (model, messages, temperature, max_tokens, context_id) 加上采样参数与工具声明的 SHA-256；
//! 值为完整响应，按策略决定 TTL。命中时不触网。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use super::{InferenceRequest, InferenceResponse};

/// 缓存策略，决定条目 TTL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStrategy {
    /// 1 小时
    Aggressive,
    /// 15 分钟
    #[default]
    Moderate,
    /// 5 分钟
    Conservative,
    /// 10 分钟起，按访问频率伸缩
    Adaptive,
}

impl CacheStrategy {
    pub fn base_ttl(&self) -> Duration {
        match self {
            CacheStrategy::Aggressive => Duration::from_secs(3_600),
            CacheStrategy::Moderate => Duration::from_secs(900),
            CacheStrategy::Conservative => Duration::from_secs(300),
            CacheStrategy::Adaptive => Duration::from_secs(600),
        }
    }
}

const ADAPTIVE_HOT_ACCESSES: u64 = 10;
const ADAPTIVE_COLD_ACCESSES: u64 = 2;

/// 计算确定性缓存键
pub fn cache_key(request: &InferenceRequest, model: &str) -> String {
    let canonical = serde_json::json!({
        "model": model,
        "messages": request.messages,
        "temperature": request.temperature,
        "max_tokens": request.max_tokens,
        "context_id": request.context_id,
        "top_p": request.top_p,
        "stop": request.stop,
        "tools": request
            .tools
            .iter()
            .map(|t| serde_json::json!({"name": t.name, "parameters": t.parameters}))
            .collect::<Vec<_>>(),
    });
    let digest = Sha256::digest(canonical.to_string().as_bytes());
    format!("ai_cache:{}", hex::encode(digest))
}

/// 缓存指标
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
}

impl CacheMetrics {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    response: InferenceResponse,
    inserted_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) >= self.ttl
    }
}

/// 进程内响应缓存；跨运行共享，临界区很短且不跨 await
pub struct ResponseCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    /// 访问计数在条目替换后保留，供 adaptive 策略使用
    access_counts: RwLock<HashMap<String, u64>>,
    default_strategy: CacheStrategy,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(CacheStrategy::default(), 10_000)
    }
}

impl ResponseCache {
    pub fn new(default_strategy: CacheStrategy, max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            access_counts: RwLock::new(HashMap::new()),
            default_strategy,
            max_entries: max_entries.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// 读取未过期条目；过期条目顺带清除
    pub fn get(&self, key: &str) -> Option<InferenceResponse> {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        match entries.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                let response = entry.response.clone();
                drop(entries);
                self.hits.fetch_add(1, Ordering::Relaxed);
                *self
                    .access_counts
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .entry(key.to_string())
                    .or_insert(0) += 1;
                Some(response)
            }
            Some(_) => {
                entries.remove(key);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn insert(&self, key: &str, response: InferenceResponse, strategy: Option<CacheStrategy>) {
        let ttl = self.ttl_for(key, strategy.unwrap_or(self.default_strategy));
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.len() >= self.max_entries && !entries.contains_key(key) {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.inserted_at)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        entries.insert(
            key.to_string(),
            CacheEntry {
                response,
                inserted_at: Instant::now(),
                ttl,
            },
        );
    }

    fn ttl_for(&self, key: &str, strategy: CacheStrategy) -> Duration {
        let base = strategy.base_ttl();
        if strategy != CacheStrategy::Adaptive {
            return base;
        }
        let accesses = self
            .access_counts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .copied()
            .unwrap_or(0);
        if accesses > ADAPTIVE_HOT_ACCESSES {
            base.mul_f64(1.5)
        } else if accesses < ADAPTIVE_COLD_ACCESSES {
            base.mul_f64(0.5)
        } else {
            base
        }
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key)
            .is_some()
    }

    /// 清空全部条目，返回清除数量
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let n = entries.len();
        entries.clear();
        self.access_counts
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        n
    }

    /// 预热：批量写入已知响应
    pub fn warm<I>(&self, items: I, strategy: Option<CacheStrategy>) -> usize
    where
        I: IntoIterator<Item = (String, InferenceResponse)>,
    {
        let mut n = 0;
        for (key, response) in items {
            self.insert(&key, response, strategy);
            n += 1;
        }
        n
    }

    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        let purged = before - entries.len();
        self.evictions.fetch_add(purged as u64, Ordering::Relaxed);
        purged
    }

    pub fn metrics(&self) -> CacheMetrics {
        CacheMetrics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.entries.read().unwrap_or_else(|e| e.into_inner()).len(),
        }
    }
}
