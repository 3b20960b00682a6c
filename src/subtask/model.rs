//! 基于模型提供方的子任务实现
//!
//! 每个能力拼装各自的系统提示后调用 ModelProvider；LoadContext 从消息仓库按 slug 读取历史。

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::StageError;
use crate::llm::{ModelProvider, ProviderError};
use crate::memory::{Message, MessageRepository, Role};
use crate::subtask::{
    parse_intent, ClassifyInput, Intent, LoadContextInput, ReadDataInput, ReplyInput,
    StageOutput, SubTaskActor,
};

/// 意图分类系统提示
pub const CLASSIFY_SYSTEM_PROMPT: &str = r#"You are an intent classifier for a data workspace assistant.
Classify the user's latest message and output ONLY a JSON object:
{"intent": "greeting" | "other" | "read-data" | "system", "needs_chart": bool, "needs_sql": bool, "complexity": "simple" | "moderate" | "complex"}
- greeting: small talk, hellos, thanks
- read-data: questions answered by querying the workspace's datasources
- system: questions about the assistant itself
- other: anything else, answered from the conversation"#;

const GREET_SYSTEM_PROMPT: &str =
    "You are a friendly data workspace assistant. Reply briefly to the user's greeting and offer help with their data.";

const SUMMARIZE_SYSTEM_PROMPT: &str =
    "You are a data workspace assistant. Answer the user's latest message using the conversation so far; summarize when asked.";

const SYSTEM_INFO_PROMPT: &str =
    "You are a data workspace assistant. Answer questions about yourself: what you can do (greet, summarize conversations, query datasources, describe the system) and which model you run on.";

/// ModelProvider + MessageRepository 组成的子任务集合
pub struct ModelSubTasks {
    provider: Arc<dyn ModelProvider>,
    messages: Arc<dyn MessageRepository>,
}

impl ModelSubTasks {
    pub fn new(provider: Arc<dyn ModelProvider>, messages: Arc<dyn MessageRepository>) -> Self {
        Self { provider, messages }
    }

    async fn invoke(&self, prompt: Vec<Message>, model: &str) -> Result<StageOutput, StageError> {
        self.provider
            .invoke(&prompt, model)
            .await
            .map_err(|e| match e {
                ProviderError::EmptyResponse => StageError::InvalidOutput(e.to_string()),
                other => StageError::Provider(other.to_string()),
            })
    }

    /// 系统提示 + 历史（不含 System 消息）；历史为空时退化为单条用户消息
    fn with_history(system: String, history: &[Message], text: &str) -> Vec<Message> {
        let mut prompt = vec![Message::system(system)];
        prompt.extend(history.iter().filter(|m| m.role != Role::System).cloned());
        if !prompt.iter().any(|m| m.role == Role::User) {
            prompt.push(Message::user(text));
        }
        prompt
    }
}

fn describe_intent(intent: &Intent) -> String {
    format!(
        "intent={}, needs_sql={}, needs_chart={}, complexity={:?}",
        intent.kind.as_str(),
        intent.needs_sql,
        intent.needs_chart,
        intent.complexity
    )
}

#[async_trait]
impl SubTaskActor for ModelSubTasks {
    async fn load_context(&self, input: LoadContextInput) -> Result<Vec<Message>, StageError> {
        let stored = self
            .messages
            .find_by_slug(&input.slug)
            .await
            .map_err(|e| StageError::Failed(e.to_string()))?;
        Ok(stored.map(|c| c.messages).unwrap_or_default())
    }

    async fn classify_intent(&self, input: ClassifyInput) -> Result<Intent, StageError> {
        let prompt = vec![
            Message::system(CLASSIFY_SYSTEM_PROMPT),
            Message::user(input.text),
        ];
        let response = self.invoke(prompt, &input.model).await?;
        parse_intent(&response.output)
    }

    async fn summarize(&self, input: ReplyInput) -> Result<StageOutput, StageError> {
        let prompt = Self::with_history(SUMMARIZE_SYSTEM_PROMPT.to_string(), &input.history, &input.text);
        self.invoke(prompt, &input.model).await
    }

    async fn greet(&self, input: ReplyInput) -> Result<StageOutput, StageError> {
        let prompt = vec![Message::system(GREET_SYSTEM_PROMPT), Message::user(input.text)];
        self.invoke(prompt, &input.model).await
    }

    async fn system_info(&self, input: ReplyInput) -> Result<StageOutput, StageError> {
        let system = format!(
            "{SYSTEM_INFO_PROMPT}\nModel: {}. Provider: {}. Engine version: {}.",
            input.model,
            self.provider.name(),
            env!("CARGO_PKG_VERSION")
        );
        let prompt = Self::with_history(system, &input.history, &input.text);
        self.invoke(prompt, &input.model).await
    }

    async fn read_data(&self, input: ReadDataInput) -> Result<StageOutput, StageError> {
        let mut system = format!(
            "You are a data analyst for the workspace conversation '{}'. \
             Translate the user's question into a query against the workspace datasources, \
             execute it, and explain the result. Classification: {}.",
            input.slug,
            describe_intent(&input.intent)
        );
        if let Some(source) = &input.prompt_source {
            system.push_str(&format!(" The question was asked from: {source}."));
        }
        let text = input
            .history
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let prompt = Self::with_history(system, &input.history, &text);
        self.invoke(prompt, &input.model).await
    }
}
