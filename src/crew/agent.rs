//! Agent：角色 + 绑定工具 + 可选短期记忆
//!
//! 每个任务的执行流程：
//! 1. 按段落组织消息（角色说明 / 输出格式 / 输入与上游输出 / 任务描述）
//! 2. 调用推理客户端；模型返回 tool call 时执行绑定工具并回填结果，最多 max_iterations 轮
//! 3. 按输出契约解析：JSON 契约先提取并清洗一次，仍不合格则追加一次纠正请求，之后判为 invalid_response

use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde_json::{json, Value};

use crate::core::CrewError;
use crate::crew::{AgentSpec, OutputContract, TaskAction, TaskInput, TaskSpec};
use crate::llm::{
    CacheStrategy, InferenceClient, InferenceError, InferenceRequest, InferenceResponse, Message,
    PromptSection, RateLimiter,
};
use crate::state::{MemoryEntry, MemoryRetention, StateStore};
use crate::tools::ToolExecutor;

static JSON_BLOCK_RE: OnceLock<Option<Regex>> = OnceLock::new();
static TRAILING_COMMA_RE: OnceLock<Option<Regex>> = OnceLock::new();

/// 从模型输出中提取 JSON：直接解析 → 截取最外层 `{...}` → 去掉尾随逗号后再试一次
pub fn extract_json(text: &str) -> Result<Value, String> {
    let trimmed = text.trim();
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        return Ok(v);
    }

    let block = JSON_BLOCK_RE
        .get_or_init(|| Regex::new(r"(?s)\{.*\}").ok())
        .as_ref()
        .and_then(|re| re.find(trimmed))
        .map(|m| m.as_str())
        .ok_or_else(|| "no JSON object found in response".to_string())?;
    if let Ok(v) = serde_json::from_str::<Value>(block) {
        return Ok(v);
    }

    let cleaned = match TRAILING_COMMA_RE
        .get_or_init(|| Regex::new(r",\s*([}\]])").ok())
        .as_ref()
    {
        Some(re) => re.replace_all(block, "$1").into_owned(),
        None => block.to_string(),
    };
    serde_json::from_str::<Value>(&cleaned).map_err(|e| format!("malformed JSON in response: {e}"))
}

/// 输出中自带的 confidence（0..=1），没有则视为 1.0
fn reported_confidence(value: &Value) -> f64 {
    value
        .get("confidence")
        .and_then(Value::as_f64)
        .filter(|c| (0.0..=1.0).contains(c))
        .unwrap_or(1.0)
}

/// 单次调用的作用域选项（由 crew 配置与执行上下文决定）
#[derive(Debug, Clone, Default)]
pub struct InvocationOptions {
    /// 缓存与用量归属；跨组织共享时为 None
    pub context_id: Option<String>,
    pub cache: bool,
    pub cache_strategy: Option<CacheStrategy>,
    /// 限流计数键
    pub rate_scope: String,
}

struct AgentMemory {
    store: Arc<dyn StateStore>,
    scope: String,
    keep: usize,
}

pub struct Agent {
    spec: AgentSpec,
    client: Arc<InferenceClient>,
    tools: ToolExecutor,
    limiter: Arc<RateLimiter>,
    memory: Option<AgentMemory>,
    max_iterations: usize,
}

impl Agent {
    pub fn new(
        spec: AgentSpec,
        client: Arc<InferenceClient>,
        tools: ToolExecutor,
        limiter: Arc<RateLimiter>,
        max_iterations: usize,
    ) -> Self {
        Self {
            spec,
            client,
            tools,
            limiter,
            memory: None,
            max_iterations,
        }
    }

    /// 开启短期记忆：每次任务完成后记录摘要，作为后续任务的参考上下文
    pub fn with_memory(mut self, store: Arc<dyn StateStore>, scope: impl Into<String>, keep: usize) -> Self {
        self.memory = Some(AgentMemory {
            store,
            scope: scope.into(),
            keep: keep.max(1),
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &AgentSpec {
        &self.spec
    }

    /// 执行任务，返回 (输出, 基础置信度)
    pub async fn perform(
        &self,
        task: &TaskSpec,
        input: &TaskInput,
        options: &InvocationOptions,
    ) -> Result<(Value, f64), CrewError> {
        let (value, confidence) = match &task.action {
            TaskAction::Tool { name } => {
                let args = json!({ "inputs": input.inputs, "context": input.context });
                let value = self.tools.execute(name, args).await?;
                task.expected_output
                    .validate(&value)
                    .map_err(|e| CrewError::DataQuality(format!("tool '{name}' output: {e}")))?;
                (value, 1.0)
            }
            TaskAction::Prompt => self.prompt(task, input, options).await?,
        };
        self.remember(task, &value).await;
        Ok((value, confidence))
    }

    async fn prompt(
        &self,
        task: &TaskSpec,
        input: &TaskInput,
        options: &InvocationOptions,
    ) -> Result<(Value, f64), CrewError> {
        let mut messages = self.build_messages(task, input).await;
        let declared = if input.simplified { Vec::new() } else { self.tools.declarations() };

        let mut rounds = 0;
        let response = loop {
            let tools = if rounds < self.max_iterations { declared.clone() } else { Vec::new() };
            let response = self.call(messages.clone(), tools, input.simplified, options).await?;
            if response.tool_calls.is_empty() || rounds >= self.max_iterations {
                break response;
            }
            rounds += 1;
            tracing::debug!(agent = %self.spec.name, task_id = %task.id, round = rounds, calls = response.tool_calls.len(), "model requested tools");
            messages.push(Message::assistant_tool_calls(
                response.content.clone(),
                response.tool_calls.clone(),
            ));
            for call in &response.tool_calls {
                let content = match self.tools.execute(&call.name, call.arguments.clone()).await {
                    Ok(v) => v.to_string(),
                    Err(e) => format!("error: {e}"),
                };
                messages.push(Message::tool(call.id.clone(), content));
            }
        };

        match &task.expected_output {
            OutputContract::Text => Ok((Value::String(response.content), 1.0)),
            contract @ OutputContract::Json { .. } => {
                match Self::parse_contract(contract, &response.content) {
                    Ok(v) => {
                        let confidence = reported_confidence(&v);
                        Ok((v, confidence))
                    }
                    Err(reason) => {
                        tracing::warn!(agent = %self.spec.name, task_id = %task.id, reason = %reason, "output does not match contract, asking once more");
                        messages.push(Message::assistant(response.content));
                        messages.push(
                            Message::user(format!(
                                "Your previous reply was not usable: {reason}. {}",
                                contract.instructions()
                            ))
                            .in_section(PromptSection::OutputFormat),
                        );
                        let retry = self.call(messages, Vec::new(), input.simplified, options).await?;
                        let v = Self::parse_contract(contract, &retry.content).map_err(|reason| {
                            CrewError::Inference(InferenceError::InvalidResponse(reason))
                        })?;
                        let confidence = reported_confidence(&v);
                        Ok((v, confidence))
                    }
                }
            }
        }
    }

    fn parse_contract(contract: &OutputContract, content: &str) -> Result<Value, String> {
        let value = extract_json(content)?;
        contract.validate(&value)?;
        Ok(value)
    }

    async fn call(
        &self,
        messages: Vec<Message>,
        tools: Vec<crate::llm::ToolDeclaration>,
        simplified: bool,
        options: &InvocationOptions,
    ) -> Result<InferenceResponse, CrewError> {
        self.limiter.acquire(&options.rate_scope).await;

        let (temperature, max_tokens) = if simplified {
            (0.0, (self.spec.max_tokens / 2).max(64))
        } else {
            (self.spec.temperature, self.spec.max_tokens)
        };
        let mut request = InferenceRequest::new(messages)
            .with_temperature(temperature)
            .with_max_tokens(max_tokens)
            .with_tools(tools);
        if let Some(model) = &self.spec.model {
            request = request.with_model(model.clone());
        }
        if let Some(context_id) = &options.context_id {
            request = request.with_context_id(context_id.clone());
        }
        if let Some(strategy) = options.cache_strategy {
            request = request.with_cache_strategy(strategy);
        }
        if !options.cache {
            request = request.without_cache();
        }
        Ok(self.client.complete(request).await?)
    }

    async fn build_messages(&self, task: &TaskSpec, input: &TaskInput) -> Vec<Message> {
        let mut persona = format!("You are {}. Goal: {}.", self.spec.role, self.spec.goal);
        if !self.spec.backstory.is_empty() {
            persona.push(' ');
            persona.push_str(&self.spec.backstory);
        }
        if input.simplified {
            persona.push_str(" Keep the answer short and strictly follow the output format.");
        }

        let mut messages = vec![
            Message::system(persona).in_section(PromptSection::Instructions),
            Message::system(task.expected_output.instructions()).in_section(PromptSection::OutputFormat),
        ];

        if !input.inputs.is_null() {
            messages.push(
                Message::user(format!("Inputs:\n{}", pretty(&input.inputs))).in_section(PromptSection::Data),
            );
        }
        for (task_id, output) in &input.context {
            messages.push(
                Message::user(format!("Output of task '{task_id}':\n{}", pretty(output)))
                    .in_section(PromptSection::Data),
            );
        }
        if let Some(notes) = self.recall().await {
            messages.push(Message::user(notes).in_section(PromptSection::Examples));
        }

        messages.push(
            Message::user(format!("Task: {}", task.description)).in_section(PromptSection::Instructions),
        );
        messages
    }

    async fn recall(&self) -> Option<String> {
        let memory = self.memory.as_ref()?;
        match memory.store.recent_memory(&memory.scope, memory.keep).await {
            Ok(entries) if !entries.is_empty() => {
                let notes: Vec<String> = entries.iter().map(|e| e.payload.to_string()).collect();
                Some(format!("Notes from earlier tasks:\n{}", notes.join("\n")))
            }
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(agent = %self.spec.name, error = %e, "failed to read agent memory");
                None
            }
        }
    }

    async fn remember(&self, task: &TaskSpec, value: &Value) {
        let Some(memory) = &self.memory else {
            return;
        };
        let summary: String = value.to_string().chars().take(500).collect();
        let entry = MemoryEntry::now(json!({ "task_id": task.id, "summary": summary }));
        if let Err(e) = memory
            .store
            .append_memory(&memory.scope, entry, MemoryRetention::Recent(memory.keep))
            .await
        {
            tracing::warn!(agent = %self.spec.name, error = %e, "failed to write agent memory");
        }
    }
}

fn pretty(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ClientConfig, MockBackend, ToolCall};
    use crate::state::InMemoryStateStore;
    use crate::tools::{EchoTool, ToolRegistry, DEFAULT_TOOL_TIMEOUT};

    fn agent_with(backend: Arc<MockBackend>, tools: &[&str]) -> Agent {
        let client = Arc::new(InferenceClient::new(backend, ClientConfig::default()));
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        let spec = AgentSpec::new("analyst", "Data Analyst", "analyze inputs").with_tools(tools);
        let executor = ToolExecutor::new(registry.subset(&spec.tools).unwrap(), DEFAULT_TOOL_TIMEOUT);
        Agent::new(spec, client, executor, Arc::new(RateLimiter::per_minute(0)), 3)
    }

    fn options() -> InvocationOptions {
        InvocationOptions {
            context_id: Some("org:acme".into()),
            cache: false,
            cache_strategy: None,
            rate_scope: "org:acme".into(),
        }
    }

    #[test]
    fn test_extract_json_variants() {
        assert_eq!(extract_json(r#"{"a": 1}"#).unwrap()["a"], 1);
        let fenced = "Here you go:\n```json\n{\"strategy\": \"Big Bang\"}\n```\nThanks";
        assert_eq!(extract_json(fenced).unwrap()["strategy"], "Big Bang");
        let trailing = "{\"items\": [1, 2,], \"ok\": true,}";
        assert_eq!(extract_json(trailing).unwrap()["items"][1], 2);
        assert!(extract_json("no json here").is_err());
        assert!(extract_json("{ broken: }").is_err());
    }

    #[tokio::test]
    async fn test_json_contract_with_corrective_call() {
        let backend = Arc::new(MockBackend::new());
        backend.push_text("I think the strategy is phased");
        backend.push_text(r#"{"strategy": "Phased Migration", "confidence": 0.8}"#);
        let agent = agent_with(backend.clone(), &[]);
        let task = TaskSpec::new("recommend", "Recommend a strategy", "analyst")
            .expecting(OutputContract::json(&["strategy"]));

        let (value, confidence) = agent.perform(&task, &TaskInput::default(), &options()).await.unwrap();
        assert_eq!(value["strategy"], "Phased Migration");
        assert_eq!(confidence, 0.8);
        assert_eq!(backend.call_count(), 2);
    }

    #[tokio::test]
    async fn test_invalid_response_after_second_failure() {
        let backend = Arc::new(MockBackend::new());
        backend.push_text("nope");
        backend.push_text("still nope");
        let agent = agent_with(backend, &[]);
        let task = TaskSpec::new("t", "x", "analyst").expecting(OutputContract::json(&["k"]));
        assert!(matches!(
            agent.perform(&task, &TaskInput::default(), &options()).await,
            Err(CrewError::Inference(InferenceError::InvalidResponse(_)))
        ));
    }

    #[tokio::test]
    async fn test_tool_loop_feeds_results_back() {
        let backend = Arc::new(MockBackend::new());
        let mut with_call = MockBackend::text_response("mock-model", "");
        with_call.tool_calls = vec![ToolCall {
            id: "call_1".into(),
            name: "echo".into(),
            arguments: json!({"text": "from tool"}),
        }];
        backend.push_response(with_call);
        backend.push_text("final answer");
        let agent = agent_with(backend.clone(), &["echo"]);
        let task = TaskSpec::new("t", "use the tool", "analyst");

        let (value, _) = agent.perform(&task, &TaskInput::default(), &options()).await.unwrap();
        assert_eq!(value, json!("final answer"));
        let requests = backend.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].tools.len(), 1);
        let tool_msg = requests[1].messages.last().unwrap();
        assert_eq!(tool_msg.tool_call_id.as_deref(), Some("call_1"));
        assert!(tool_msg.content.contains("from tool"));
    }

    #[tokio::test]
    async fn test_memory_is_recalled_in_later_prompts() {
        let backend = Arc::new(MockBackend::new());
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::default());
        let agent = agent_with(backend.clone(), &[]).with_memory(store, "agent:analyst", 5);
        let first = TaskSpec::new("first", "first task", "analyst");
        let second = TaskSpec::new("second", "second task", "analyst");

        agent.perform(&first, &TaskInput::default(), &options()).await.unwrap();
        agent.perform(&second, &TaskInput::default(), &options()).await.unwrap();

        let requests = backend.requests();
        let recalled = requests[1]
            .messages
            .iter()
            .any(|m| m.content.starts_with("Notes from earlier tasks") && m.content.contains("first"));
        assert!(recalled);
    }

    #[tokio::test]
    async fn test_simplified_mode_drops_tools_and_temperature() {
        let backend = Arc::new(MockBackend::new());
        let agent = agent_with(backend.clone(), &["echo"]);
        let task = TaskSpec::new("t", "x", "analyst");
        let input = TaskInput {
            simplified: true,
            ..TaskInput::default()
        };
        agent.perform(&task, &input, &options()).await.unwrap();
        let request = &backend.requests()[0];
        assert!(request.tools.is_empty());
        assert_eq!(request.temperature, 0.0);
        assert_eq!(request.max_tokens, 512);
    }
}
