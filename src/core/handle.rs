//! 流式结果句柄：子任务成功后产生，归属产生它的那一轮
//!
//! 输出文本立即可用；token 用量是独立完成的 future，句柄可克隆、可跨任务传递。

use std::sync::Arc;

use futures_util::stream::{self, BoxStream, StreamExt};
use uuid::Uuid;

use crate::core::state::Stage;
use crate::llm::{TokenUsage, UsageFuture};

#[derive(Clone)]
pub struct StreamHandle {
    id: Uuid,
    generation: u64,
    input: Arc<str>,
    stage: Stage,
    output: Arc<str>,
    usage: UsageFuture,
}

impl StreamHandle {
    pub fn new(
        generation: u64,
        input: &str,
        stage: Stage,
        output: String,
        usage: UsageFuture,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            generation,
            input: Arc::from(input),
            stage,
            output: Arc::from(output),
            usage,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// 产生该结果的轮次代号
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// 产生该结果时的输入文本
    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    /// 按词切分的输出流（保留空白），供调用方逐段渲染
    pub fn stream(&self) -> BoxStream<'static, String> {
        let output = self.output.clone();
        let mut chunks = Vec::new();
        let mut current = String::new();
        for ch in output.chars() {
            current.push(ch);
            if ch.is_whitespace() {
                chunks.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            chunks.push(current);
        }
        stream::iter(chunks).boxed()
    }

    /// 等待 token 用量；提供方不报告时为 None
    pub async fn usage(&self) -> Option<TokenUsage> {
        self.usage.clone().await
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("stage", &self.stage)
            .field("input", &self.input)
            .finish_non_exhaustive()
    }
}

impl PartialEq for StreamHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
