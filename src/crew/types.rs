//! Crew 类型定义
//!
//! 定义执行方式、任务、Agent、输出契约、任务输出与错误记录等核心数据类型

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::CacheStrategy;
use crate::recovery::{Classification, ErrorCategory, RecoveryStrategy, Severity};

pub type TaskId = String;

/// 执行方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Process {
    /// 严格按依赖顺序逐个执行
    #[default]
    Sequential,
    /// 独立任务并发执行，受 worker 上限约束
    Parallel,
    /// manager 任务先出计划，再分阶段执行
    Hierarchical,
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// 等待执行
    Pending,
    /// 正在执行
    Running,
    /// 失败后正在执行恢复策略
    Recovering,
    /// 已完成
    Succeeded,
    /// 失败
    Failed,
    /// 跳过（上游失败、提前终止或 manager 决定）
    Skipped,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Skipped
        )
    }
}

/// 任务被跳过的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// 上游任务失败或被跳过
    UpstreamFailed,
    /// sequential 因前序任务失败或降级而提前结束
    EarlyStop,
    /// 前序任务输出了 terminate 信号
    Terminated,
    /// manager 复核时决定不再需要
    ManagerSkipped,
    /// 超出墙钟预算
    BudgetExceeded,
    /// 依赖始终未满足
    Unreachable,
}

impl SkipReason {
    /// 主动放弃（terminate 或 manager 决定）的任务不影响 crew 是否成功
    pub fn is_intentional(&self) -> bool {
        matches!(self, SkipReason::Terminated | SkipReason::ManagerSkipped)
    }
}

/// 期望输出契约
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputContract {
    /// 自由文本
    #[default]
    Text,
    /// JSON 对象，必须包含 required_keys
    Json {
        #[serde(default)]
        required_keys: Vec<String>,
        /// 可选 JSON Schema，仅用于提示模型
        #[serde(default, skip_serializing_if = "Option::is_none")]
        schema: Option<Value>,
    },
}

impl OutputContract {
    pub fn json(required_keys: &[&str]) -> Self {
        OutputContract::Json {
            required_keys: required_keys.iter().map(|k| k.to_string()).collect(),
            schema: None,
        }
    }

    pub fn is_json(&self) -> bool {
        matches!(self, OutputContract::Json { .. })
    }

    /// 检查输出形状
    pub fn validate(&self, value: &Value) -> Result<(), String> {
        match self {
            OutputContract::Text => Ok(()),
            OutputContract::Json { required_keys, .. } => {
                let obj = value
                    .as_object()
                    .ok_or_else(|| "expected a JSON object".to_string())?;
                let missing: Vec<&str> = required_keys
                    .iter()
                    .filter(|k| !obj.contains_key(k.as_str()))
                    .map(String::as_str)
                    .collect();
                if missing.is_empty() {
                    Ok(())
                } else {
                    Err(format!("missing keys: {}", missing.join(", ")))
                }
            }
        }
    }

    /// 写入 prompt 的输出格式说明
    pub fn instructions(&self) -> String {
        match self {
            OutputContract::Text => "Respond with plain text.".to_string(),
            OutputContract::Json {
                required_keys,
                schema,
            } => {
                let mut s = format!(
                    "Respond with a single JSON object containing the keys: {}. Do not add prose outside the JSON.",
                    required_keys.join(", ")
                );
                if let Some(schema) = schema {
                    s.push_str("\nJSON schema:\n");
                    s.push_str(&schema.to_string());
                }
                s
            }
        }
    }
}

/// 任务动作：交给模型，或直接调用绑定的工具
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskAction {
    #[default]
    Prompt,
    Tool { name: String },
}

/// 任务执行时的输入
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskInput {
    /// crew 级输入
    pub inputs: Value,
    /// 上游任务输出（task_id → value）
    pub context: BTreeMap<TaskId, Value>,
    /// 简化请求模式
    #[serde(default)]
    pub simplified: bool,
}

/// 规则兜底：不调用推理服务，直接从输入推导结果
pub type RuleFallback = Arc<dyn Fn(&TaskInput) -> Option<Value> + Send + Sync>;

/// 任务定义（crew 开始执行后不可变）
#[derive(Clone)]
pub struct TaskSpec {
    pub id: TaskId,
    pub description: String,
    pub expected_output: OutputContract,
    /// 执行该任务的 agent 名
    pub agent: String,
    /// 上游任务，其输出作为上下文注入
    pub depends_on: Vec<TaskId>,
    pub action: TaskAction,
    /// 关键任务失败时 crew 不成功
    pub critical: bool,
    /// 置信度聚合权重
    pub weight: f64,
    pub fallback: Option<RuleFallback>,
}

impl std::fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSpec")
            .field("id", &self.id)
            .field("agent", &self.agent)
            .field("depends_on", &self.depends_on)
            .field("action", &self.action)
            .field("critical", &self.critical)
            .field("weight", &self.weight)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl TaskSpec {
    pub fn new(id: impl Into<TaskId>, description: impl Into<String>, agent: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            expected_output: OutputContract::Text,
            agent: agent.into(),
            depends_on: Vec::new(),
            action: TaskAction::Prompt,
            critical: true,
            weight: 1.0,
            fallback: None,
        }
    }

    pub fn expecting(mut self, contract: OutputContract) -> Self {
        self.expected_output = contract;
        self
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskId>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn using_tool(mut self, name: impl Into<String>) -> Self {
        self.action = TaskAction::Tool { name: name.into() };
        self
    }

    pub fn non_critical(mut self) -> Self {
        self.critical = false;
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight.max(0.0);
        self
    }

    pub fn with_fallback<F>(mut self, f: F) -> Self
    where
        F: Fn(&TaskInput) -> Option<Value> + Send + Sync + 'static,
    {
        self.fallback = Some(Arc::new(f));
        self
    }
}

/// Agent 定义：角色、目标与可调用工具
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    pub role: String,
    pub goal: String,
    #[serde(default)]
    pub backstory: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub model: Option<String>,
}

fn default_temperature() -> f32 {
    0.3
}

fn default_max_tokens() -> u32 {
    1024
}

impl AgentSpec {
    pub fn new(name: impl Into<String>, role: impl Into<String>, goal: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: role.into(),
            goal: goal.into(),
            backstory: String::new(),
            tools: Vec::new(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            model: None,
        }
    }

    pub fn with_backstory(mut self, backstory: impl Into<String>) -> Self {
        self.backstory = backstory.into();
        self
    }

    pub fn with_tools(mut self, tools: &[&str]) -> Self {
        self.tools = tools.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

/// Crew 配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrewConfig {
    /// Agent 短期记忆开关
    pub memory: bool,
    /// 推理响应缓存开关
    pub cache: bool,
    pub cache_strategy: Option<CacheStrategy>,
    /// 每分钟推理请求上限（0 表示不限）
    pub max_rpm: u32,
    /// 结果（缓存）是否跨组织共享
    pub share_across_orgs: bool,
    pub max_workers: usize,
    pub wall_clock_budget_secs: u64,
}

impl Default for CrewConfig {
    fn default() -> Self {
        Self {
            memory: false,
            cache: true,
            cache_strategy: None,
            max_rpm: 0,
            share_across_orgs: false,
            max_workers: 4,
            wall_clock_budget_secs: 900,
        }
    }
}

impl CrewConfig {
    pub fn wall_clock_budget(&self) -> Duration {
        Duration::from_secs(self.wall_clock_budget_secs)
    }
}

/// 任务输出
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub task_id: TaskId,
    pub value: Value,
    pub confidence: f64,
    /// 输出要求提前结束顺序执行
    #[serde(default)]
    pub terminate: bool,
    /// 由 degraded_service 产生
    #[serde(default)]
    pub degraded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovered_by: Option<RecoveryStrategy>,
}

impl TaskOutput {
    pub fn new(task_id: impl Into<TaskId>, value: Value, confidence: f64) -> Self {
        let terminate = value.get("terminate").and_then(Value::as_bool).unwrap_or(false);
        Self {
            task_id: task_id.into(),
            value,
            confidence: confidence.clamp(0.0, 1.0),
            terminate,
            degraded: false,
            recovered_by: None,
        }
    }

    pub fn recovered(mut self, strategy: RecoveryStrategy) -> Self {
        self.degraded = strategy == RecoveryStrategy::DegradedService;
        self.recovered_by = Some(strategy);
        self
    }
}

/// 错误日志条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub task_id: Option<TaskId>,
    pub category: ErrorCategory,
    pub severity: Severity,
    pub message: String,
    /// 成功恢复时使用的策略；None 表示未恢复
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovered_by: Option<RecoveryStrategy>,
    pub timestamp: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn new(task_id: Option<&str>, classification: &Classification, message: impl Into<String>) -> Self {
        Self {
            task_id: task_id.map(String::from),
            category: classification.category,
            severity: classification.severity,
            message: message.into(),
            recovered_by: None,
            timestamp: Utc::now(),
        }
    }

    pub fn recovered_by(mut self, strategy: RecoveryStrategy) -> Self {
        self.recovered_by = Some(strategy);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_contract_validation() {
        let c = OutputContract::json(&["strategy", "rationale"]);
        assert!(c.validate(&json!({"strategy": "x", "rationale": "y"})).is_ok());
        let err = c.validate(&json!({"strategy": "x"})).unwrap_err();
        assert!(err.contains("rationale"));
        assert!(c.validate(&json!("text")).is_err());
        assert!(OutputContract::Text.validate(&json!(1)).is_ok());
    }

    #[test]
    fn test_task_output_terminate_flag() {
        let out = TaskOutput::new("t", json!({"terminate": true}), 1.4);
        assert!(out.terminate);
        assert_eq!(out.confidence, 1.0);
        let out = TaskOutput::new("t", json!("plain"), 0.5).recovered(RecoveryStrategy::DegradedService);
        assert!(out.degraded && !out.terminate);
    }

    #[test]
    fn test_terminal_states() {
        assert!(TaskState::Skipped.is_terminal());
        assert!(!TaskState::Recovering.is_terminal());
        assert!(SkipReason::ManagerSkipped.is_intentional());
        assert!(!SkipReason::UpstreamFailed.is_intentional());
    }
}
