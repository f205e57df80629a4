//! 推理请求 / 响应类型
//!
//! 消息带角色与可选的 prompt 段标记（instructions / output_format / examples / data），
//! 预算裁剪时按段优先级决定保留顺序。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::cache::CacheStrategy;

/// 消息角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    /// 工具执行结果回填
    Tool,
}

/// Prompt 段：数字越小越优先保留
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptSection {
    Instructions,
    OutputFormat,
    Examples,
    Data,
}

impl PromptSection {
    pub fn priority(&self) -> u8 {
        match self {
            PromptSection::Instructions => 0,
            PromptSection::OutputFormat => 1,
            PromptSection::Examples => 2,
            PromptSection::Data => 3,
        }
    }

    /// 截断顺序：先 data，最后 instructions
    pub fn truncation_order() -> [PromptSection; 4] {
        [
            PromptSection::Data,
            PromptSection::Examples,
            PromptSection::OutputFormat,
            PromptSection::Instructions,
        ]
    }
}

/// 单条消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<PromptSection>,
    /// Tool 消息对应的工具调用 id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Assistant 消息发起的工具调用
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl Message {
    fn with_role(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            section: None,
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    pub fn assistant_tool_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::with_role(Role::Assistant, content)
        }
    }

    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            ..Self::with_role(Role::Tool, content)
        }
    }

    pub fn in_section(mut self, section: PromptSection) -> Self {
        self.section = Some(section);
        self
    }

    /// 未显式标记时：system 视为 instructions，其余视为 data
    pub fn effective_section(&self) -> PromptSection {
        self.section.unwrap_or(match self.role {
            Role::System => PromptSection::Instructions,
            _ => PromptSection::Data,
        })
    }
}

/// 可供模型调用的工具声明（function calling）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// 模型返回的工具调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// 推理请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    /// None 时使用客户端默认模型
    pub model: Option<String>,
    pub messages: Vec<Message>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: Option<f32>,
    #[serde(default)]
    pub stop: Vec<String>,
    #[serde(default)]
    pub tools: Vec<ToolDeclaration>,
    /// 缓存作用域与用量归属
    pub context_id: Option<String>,
    pub use_cache: bool,
    pub cache_strategy: Option<CacheStrategy>,
}

impl InferenceRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            model: None,
            messages,
            temperature: 0.7,
            max_tokens: 1024,
            top_p: None,
            stop: Vec::new(),
            tools: Vec::new(),
            context_id: None,
            use_cache: true,
            cache_strategy: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }

    pub fn with_stop(mut self, stop: Vec<String>) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDeclaration>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_context_id(mut self, context_id: impl Into<String>) -> Self {
        self.context_id = Some(context_id.into());
        self
    }

    pub fn with_cache_strategy(mut self, strategy: CacheStrategy) -> Self {
        self.cache_strategy = Some(strategy);
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.use_cache = false;
        self
    }
}

/// Token 用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// 响应元数据（不参与缓存键）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseMetadata {
    pub cache_hit: bool,
    /// 实际 HTTP 尝试次数（含重试）
    pub attempts: u32,
    /// 发送前是否被预算裁剪
    pub trimmed: bool,
    pub endpoint: String,
}

/// 推理响应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub id: String,
    pub model: String,
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: Option<String>,
    pub usage: Usage,
    #[serde(default)]
    pub metadata: ResponseMetadata,
}

/// 流式响应的一个增量片段
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InferenceChunk {
    pub delta: String,
    pub finish_reason: Option<String>,
    /// 仅最后一个片段可能携带
    pub usage: Option<Usage>,
    pub cache_hit: bool,
}
