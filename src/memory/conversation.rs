//! 对话消息：角色、内容与触发元数据
//!
//! Turn 携带完整消息列表；最后一条 User 消息决定本轮输入文本，其元数据中的 prompt_source 会写入上下文。

use serde::{Deserialize, Serialize};

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 消息附带的元数据（由调用方填写，编排层只读取 prompt_source）
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// 触发本轮的入口标记，如 "notebook"、"chat"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_source: Option<String>,
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            metadata: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            metadata: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            metadata: None,
        }
    }

    /// 附加 prompt_source 元数据
    pub fn with_prompt_source(mut self, source: impl Into<String>) -> Self {
        self.metadata
            .get_or_insert_with(MessageMetadata::default)
            .prompt_source = Some(source.into());
        self
    }

    pub fn prompt_source(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.prompt_source.as_deref())
    }
}

/// 取最后一条 User 消息（本轮的触发消息）
pub fn last_user_message(messages: &[Message]) -> Option<&Message> {
    messages.iter().rev().find(|m| m.role == Role::User)
}
