//! 模型提供方抽象
//!
//! 编排层只关心 output 文本与「稍后可得」的 token 用量，不解析各家响应格式。

use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::memory::Message;

/// 单次调用的 token 用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// 可克隆的用量 future：结果句柄产生后才完成；提供方不报告用量时为 None
pub type UsageFuture = Shared<BoxFuture<'static, Option<TokenUsage>>>;

/// 已知用量（或无用量）直接包装成已完成的 future
pub fn usage_ready(usage: Option<TokenUsage>) -> UsageFuture {
    futures_util::future::ready(usage).boxed().shared()
}

/// 用量稍后由发送端填入；发送端被丢弃时 future 以 None 完成
pub fn usage_channel() -> (oneshot::Sender<TokenUsage>, UsageFuture) {
    let (tx, rx) = oneshot::channel();
    let fut = async move { rx.await.ok() }.boxed().shared();
    (tx, fut)
}

/// 模型调用结果
#[derive(Clone)]
pub struct ModelResponse {
    pub output: String,
    pub usage: UsageFuture,
}

impl std::fmt::Debug for ModelResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelResponse")
            .field("output", &self.output)
            .finish_non_exhaustive()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("rate limited")]
    RateLimited,

    #[error("empty response")]
    EmptyResponse,
}

/// 模型提供方：invoke(prompt, model) → { output, usage }
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn invoke(&self, messages: &[Message], model: &str)
        -> Result<ModelResponse, ProviderError>;

    /// 用于日志
    fn name(&self) -> &str {
        "unknown"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_usage_channel_resolves_later() {
        let (tx, usage) = usage_channel();
        let cloned = usage.clone();
        tx.send(TokenUsage::new(10, 5)).unwrap();
        assert_eq!(usage.await, Some(TokenUsage::new(10, 5)));
        assert_eq!(cloned.await.map(|u| u.total_tokens), Some(15));
    }

    #[tokio::test]
    async fn test_usage_channel_dropped_sender() {
        let (tx, usage) = usage_channel();
        drop(tx);
        assert_eq!(usage.await, None);
    }
}
