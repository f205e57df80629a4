//! 推理后端抽象
//!
//! 所有后端（OpenAI 兼容 HTTP / Mock）实现 InferenceBackend：send（非流式）、send_stream（流式片段）。
//! 缓存、限流、重试与熔断都在 InferenceClient 中完成，后端只负责一次传输。

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{stream, Stream};

use super::{InferenceChunk, InferenceError, InferenceRequest, InferenceResponse};

/// 流式片段
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<InferenceChunk, InferenceError>> + Send>>;

#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// 端点标识，熔断器按它分组
    fn endpoint(&self) -> &str;

    fn default_model(&self) -> &str;

    /// 单次传输，不做重试
    async fn send(&self, request: &InferenceRequest) -> Result<InferenceResponse, InferenceError>;

    /// 流式传输；默认实现把完整响应作为单个片段返回
    async fn send_stream(&self, request: &InferenceRequest) -> Result<ChunkStream, InferenceError> {
        let response = self.send(request).await?;
        let chunk = InferenceChunk {
            delta: response.content,
            finish_reason: response.finish_reason,
            usage: Some(response.usage),
            cache_hit: false,
        };
        Ok(Box::pin(stream::iter(vec![Ok(chunk)])))
    }
}
