//! 推理层：后端抽象与实现（OpenAI 兼容 HTTP / Mock）、响应缓存、预算裁剪、限流与用量统计

pub mod budget;
pub mod cache;
pub mod client;
pub mod error;
pub mod mock;
pub mod openai;
pub mod rate_limit;
pub mod traits;
pub mod types;
pub mod usage;

pub use budget::{BudgetReport, BudgetStep, TokenBudgetOptimizer, TokenEstimator};
pub use cache::{cache_key, CacheMetrics, CacheStrategy, ResponseCache};
pub use client::{ClientConfig, InferenceClient};
pub use error::InferenceError;
pub use mock::MockBackend;
pub use openai::{OpenAiBackend, DEEPINFRA_BASE_URL, DEFAULT_MODEL};
pub use rate_limit::RateLimiter;
pub use traits::{ChunkStream, InferenceBackend};
pub use types::{
    InferenceChunk, InferenceRequest, InferenceResponse, Message, PromptSection, ResponseMetadata,
    Role, ToolCall, ToolDeclaration, Usage,
};
pub use usage::{Pricing, UsageMonitor, UsageRecord};
