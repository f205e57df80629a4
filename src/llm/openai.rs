//! OpenAI 兼容 HTTP 后端
//!
//! 直接用 reqwest 调用 `{base_url}/chat/completions`，以便拿到原始状态码与 Retry-After 头；
//! 默认端点为 DeepInfra 的 OpenAI 兼容接口。流式模式解析 SSE `data:` 行。

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde_json::{json, Value};

use super::traits::ChunkStream;
use super::{
    InferenceBackend, InferenceChunk, InferenceError, InferenceRequest, InferenceResponse, Message,
    Role, ToolCall, Usage,
};

pub const DEEPINFRA_BASE_URL: &str = "https://api.deepinfra.com/v1/openai";
pub const DEFAULT_MODEL: &str = "meta-llama/Llama-4-Maverick-17B";

/// OpenAI 兼容后端：持有 HTTP client、base_url、key 与默认模型
pub struct OpenAiBackend {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
}

impl OpenAiBackend {
    pub fn new(
        base_url: Option<&str>,
        model: &str,
        api_key: &str,
        timeout: Duration,
    ) -> Result<Self, InferenceError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| InferenceError::Network(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url
                .unwrap_or(DEEPINFRA_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            timeout,
        })
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn body(&self, request: &InferenceRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": request.model.as_deref().unwrap_or(&self.model),
            "messages": request.messages.iter().map(wire_message).collect::<Vec<_>>(),
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "stream": stream,
        });
        if let Some(top_p) = request.top_p {
            body["top_p"] = json!(top_p);
        }
        if !request.stop.is_empty() {
            body["stop"] = json!(request.stop);
        }
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(
                request
                    .tools
                    .iter()
                    .map(|t| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.parameters,
                            }
                        })
                    })
                    .collect(),
            );
        }
        body
    }

    fn map_transport(&self, e: reqwest::Error) -> InferenceError {
        if e.is_timeout() {
            InferenceError::Timeout(self.timeout)
        } else {
            InferenceError::Network(e.to_string())
        }
    }

    async fn post(&self, request: &InferenceRequest, stream: bool) -> Result<reqwest::Response, InferenceError> {
        let response = self
            .http
            .post(self.url())
            .bearer_auth(&self.api_key)
            .json(&self.body(request, stream))
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        tracing::warn!(status = status.as_u16(), endpoint = %self.base_url, "inference endpoint returned error status");
        Err(InferenceError::from_status(status.as_u16(), body, retry_after))
    }
}

fn wire_message(m: &Message) -> Value {
    let role = match m.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };
    let mut v = json!({ "role": role, "content": m.content });
    if let Some(id) = &m.tool_call_id {
        v["tool_call_id"] = json!(id);
    }
    if !m.tool_calls.is_empty() {
        v["tool_calls"] = Value::Array(
            m.tool_calls
                .iter()
                .map(|c| {
                    json!({
                        "id": c.id,
                        "type": "function",
                        "function": { "name": c.name, "arguments": c.arguments.to_string() }
                    })
                })
                .collect(),
        );
    }
    v
}

/// Retry-After 只支持秒数形式
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|s| s.is_finite() && *s >= 0.0)
        .map(Duration::from_secs_f64)
}

fn parse_usage(v: &Value) -> Option<Usage> {
    let u = v.get("usage")?;
    Some(Usage {
        prompt_tokens: u.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0),
        completion_tokens: u.get("completion_tokens").and_then(Value::as_u64).unwrap_or(0),
    })
}

fn parse_tool_calls(message: &Value) -> Result<Vec<ToolCall>, InferenceError> {
    let Some(calls) = message.get("tool_calls").and_then(Value::as_array) else {
        return Ok(Vec::new());
    };
    calls
        .iter()
        .map(|c| {
            let function = c
                .get("function")
                .ok_or_else(|| InferenceError::InvalidResponse("tool call without function".into()))?;
            let name = function
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| InferenceError::InvalidResponse("tool call without name".into()))?;
            // arguments 是 JSON 字符串；解析失败时原样保留为字符串
            let arguments = match function.get("arguments") {
                Some(Value::String(raw)) => {
                    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()))
                }
                Some(other) => other.clone(),
                None => Value::Object(Default::default()),
            };
            Ok(ToolCall {
                id: c
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                name: name.to_string(),
                arguments,
            })
        })
        .collect()
}

/// 解析非流式响应体
pub fn parse_completion(v: &Value) -> Result<InferenceResponse, InferenceError> {
    let choice = v
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .ok_or_else(|| InferenceError::InvalidResponse("response has no choices".into()))?;
    let message = choice
        .get("message")
        .ok_or_else(|| InferenceError::InvalidResponse("choice has no message".into()))?;
    let content = message
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let tool_calls = parse_tool_calls(message)?;
    if content.is_empty() && tool_calls.is_empty() {
        return Err(InferenceError::InvalidResponse("empty completion".into()));
    }
    Ok(InferenceResponse {
        id: v.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
        model: v.get("model").and_then(Value::as_str).unwrap_or_default().to_string(),
        content,
        tool_calls,
        finish_reason: choice
            .get("finish_reason")
            .and_then(Value::as_str)
            .map(String::from),
        usage: parse_usage(v).unwrap_or_default(),
        metadata: Default::default(),
    })
}

enum SseLine {
    Chunk(InferenceChunk),
    Done,
    Skip,
    Invalid(InferenceError),
}

fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }
    if data.is_empty() {
        return SseLine::Skip;
    }
    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => return SseLine::Invalid(InferenceError::InvalidResponse(e.to_string())),
    };
    let choice = v.get("choices").and_then(Value::as_array).and_then(|c| c.first());
    SseLine::Chunk(InferenceChunk {
        delta: choice
            .and_then(|c| c.pointer("/delta/content"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        finish_reason: choice
            .and_then(|c| c.get("finish_reason"))
            .and_then(Value::as_str)
            .map(String::from),
        usage: parse_usage(&v),
        cache_hit: false,
    })
}

#[async_trait]
impl InferenceBackend for OpenAiBackend {
    fn endpoint(&self) -> &str {
        &self.base_url
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    async fn send(&self, request: &InferenceRequest) -> Result<InferenceResponse, InferenceError> {
        let response = self.post(request, false).await?;
        let v: Value = response
            .json()
            .await
            .map_err(|e| InferenceError::InvalidResponse(e.to_string()))?;
        parse_completion(&v)
    }

    async fn send_stream(&self, request: &InferenceRequest) -> Result<ChunkStream, InferenceError> {
        let response = self.post(request, true).await?;
        let bytes = Box::pin(response.bytes_stream());
        let state = (bytes, Vec::<u8>::new(), VecDeque::new(), false);

        let stream = futures_util::stream::unfold(state, |(mut bytes, mut buffer, mut pending, mut done)| async move {
            loop {
                if let Some(item) = pending.pop_front() {
                    return Some((item, (bytes, buffer, pending, done)));
                }
                if done {
                    return None;
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => {
                        buffer.extend_from_slice(&chunk);
                        while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                            let line: Vec<u8> = buffer.drain(..=pos).collect();
                            let line = String::from_utf8_lossy(&line);
                            match parse_sse_line(line.trim()) {
                                SseLine::Chunk(c) => pending.push_back(Ok(c)),
                                SseLine::Done => {
                                    done = true;
                                    break;
                                }
                                SseLine::Skip => {}
                                SseLine::Invalid(e) => {
                                    pending.push_back(Err(e));
                                    done = true;
                                    break;
                                }
                            }
                        }
                    }
                    Some(Err(e)) => {
                        pending.push_back(Err(InferenceError::Network(e.to_string())));
                        done = true;
                    }
                    None => done = true,
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
