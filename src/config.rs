//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `CREWLINE__*` 覆盖（双下划线表示嵌套，如 `CREWLINE__LLM__MODEL=...`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::llm::CacheStrategy;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub cache: CacheSection,
    pub circuit_breaker: CircuitBreakerSection,
    pub recovery: RecoverySection,
    pub state: StateSection,
    pub crew: CrewSection,
}

/// [app] 段：并发运行上限、执行记录保留时长
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    /// 同时运行的 crew 数；超出的提交进入 queued
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
    /// 已结束执行记录的保留小时数
    #[serde(default = "default_run_retention_hours")]
    pub run_retention_hours: u64,
}

fn default_max_concurrent_runs() -> usize {
    4
}

fn default_run_retention_hours() -> u64 {
    24
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            max_concurrent_runs: default_max_concurrent_runs(),
            run_retention_hours: default_run_retention_hours(),
        }
    }
}

/// [llm] 段：推理端点、超时、重试、预算与计价
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：deepinfra / openai / mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    /// 未设置时依次读取 DEEPINFRA_API_KEY、OPENAI_API_KEY
    pub api_key: Option<String>,
    pub request_timeout_secs: u64,
    pub max_concurrent_requests: usize,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// 单次请求的 prompt token 上限
    pub max_prompt_tokens: usize,
    /// 客户端全局每分钟请求数（0 表示不限）
    pub requests_per_minute: u32,
    pub prompt_cost_per_1k: f64,
    pub completion_cost_per_1k: f64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "deepinfra".to_string(),
            model: crate::llm::DEFAULT_MODEL.to_string(),
            base_url: None,
            api_key: None,
            request_timeout_secs: 60,
            max_concurrent_requests: 8,
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            max_prompt_tokens: 6_000,
            requests_per_minute: 0,
            prompt_cost_per_1k: 0.00015,
            completion_cost_per_1k: 0.0006,
        }
    }
}

impl LlmSection {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// 配置中的 key 优先，其次环境变量
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| std::env::var("DEEPINFRA_API_KEY").ok())
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
    }
}

/// [cache] 段：响应缓存开关与默认策略
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub enabled: bool,
    pub strategy: CacheStrategy,
    pub max_entries: usize,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: CacheStrategy::Moderate,
            max_entries: 10_000,
        }
    }
}

/// [circuit_breaker] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSection {
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 30,
        }
    }
}

/// [recovery] 段：任务级重试与各策略的置信度折扣
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoverySection {
    pub max_task_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_discount: f64,
    pub cache_discount: f64,
    pub simplified_discount: f64,
    pub rule_based_confidence: f64,
    /// 降级结果的置信度，始终会被压到 0.3 以下
    pub degraded_confidence: f64,
    pub enable_degraded: bool,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            max_task_retries: 3,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 30_000,
            retry_discount: 0.9,
            cache_discount: 0.7,
            simplified_discount: 0.8,
            rule_based_confidence: 0.5,
            degraded_confidence: 0.2,
            enable_degraded: true,
        }
    }
}

/// [state] 段：状态存储后端与各类 TTL
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StateSection {
    /// memory / sqlite
    pub backend: String,
    pub sqlite_path: PathBuf,
    /// 运行中状态 TTL（秒，至少 1 小时）
    pub state_ttl_secs: u64,
    /// 检查点 TTL（秒，至少 24 小时）
    pub checkpoint_ttl_secs: u64,
    /// 短期记忆保留条数
    pub short_term_entries: usize,
    /// 长期记忆 TTL（秒）
    pub long_term_ttl_secs: u64,
}

impl Default for StateSection {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            sqlite_path: PathBuf::from("data/crewline.db"),
            state_ttl_secs: 3_600,
            checkpoint_ttl_secs: 86_400,
            short_term_entries: 20,
            long_term_ttl_secs: 7 * 86_400,
        }
    }
}

const MIN_STATE_TTL_SECS: u64 = 3_600;
const MIN_CHECKPOINT_TTL_SECS: u64 = 86_400;

impl StateSection {
    pub fn state_ttl(&self) -> Duration {
        Duration::from_secs(self.state_ttl_secs.max(MIN_STATE_TTL_SECS))
    }

    pub fn checkpoint_ttl(&self) -> Duration {
        Duration::from_secs(self.checkpoint_ttl_secs.max(MIN_CHECKPOINT_TTL_SECS))
    }

    pub fn long_term_ttl(&self) -> Duration {
        Duration::from_secs(self.long_term_ttl_secs)
    }
}

/// [crew] 段：默认并发、墙钟预算、Agent 工具循环轮数
#[derive(Debug, Clone, Deserialize)]
pub struct CrewSection {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_wall_clock_budget_secs")]
    pub wall_clock_budget_secs: u64,
    #[serde(default = "default_max_agent_iterations")]
    pub max_agent_iterations: usize,
    /// hierarchical 模式下每阶段结束后是否让 manager 复核
    #[serde(default = "default_review_phases")]
    pub review_phases: bool,
}

fn default_max_workers() -> usize {
    4
}

fn default_wall_clock_budget_secs() -> u64 {
    900
}

fn default_max_agent_iterations() -> usize {
    3
}

fn default_review_phases() -> bool {
    true
}

impl Default for CrewSection {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            wall_clock_budget_secs: default_wall_clock_budget_secs(),
            max_agent_iterations: default_max_agent_iterations(),
            review_phases: default_review_phases(),
        }
    }
}

impl CrewSection {
    pub fn wall_clock_budget(&self) -> Duration {
        Duration::from_secs(self.wall_clock_budget_secs)
    }
}

/// 从 config 目录加载配置，环境变量 CREWLINE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 CREWLINE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("CREWLINE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
