//! 子任务：会话状态机调用的异步工作单元
//!
//! 能力集合：LoadContext、ClassifyIntent、Summarize、Greet、ReadData、SystemInfo。
//! 每个能力接收类型化输入、返回类型化输出或 StageError；超时与取消由调用方（会话 actor）负责。

pub mod intent;
pub mod model;

use async_trait::async_trait;

pub use intent::{parse_intent, Complexity, Intent, IntentKind};
pub use model::{ModelSubTasks, CLASSIFY_SYSTEM_PROMPT};

use crate::core::StageError;
use crate::llm::ModelResponse;
use crate::memory::Message;

/// 产生流式结果的阶段输出（文本 + 稍后可得的用量）
pub type StageOutput = ModelResponse;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadContextInput {
    pub conversation_id: String,
    pub slug: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifyInput {
    pub text: String,
    pub model: String,
}

/// 问候 / 总结 / 系统信息共用的输入
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyInput {
    pub text: String,
    pub model: String,
    pub intent: Option<Intent>,
    pub history: Vec<Message>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadDataInput {
    pub slug: String,
    pub history: Vec<Message>,
    pub model: String,
    pub prompt_source: Option<String>,
    pub intent: Intent,
}

/// 子任务能力集合；实现方只负责做事，不关心重试、超时与过期结果
#[async_trait]
pub trait SubTaskActor: Send + Sync {
    async fn load_context(&self, input: LoadContextInput) -> Result<Vec<Message>, StageError>;

    async fn classify_intent(&self, input: ClassifyInput) -> Result<Intent, StageError>;

    async fn summarize(&self, input: ReplyInput) -> Result<StageOutput, StageError>;

    async fn greet(&self, input: ReplyInput) -> Result<StageOutput, StageError>;

    async fn system_info(&self, input: ReplyInput) -> Result<StageOutput, StageError>;

    async fn read_data(&self, input: ReadDataInput) -> Result<StageOutput, StageError>;
}
