//! 消息与用量仓库
//!
//! LoadContext 通过 slug 查找历史消息；轮次成功后追加最终的助手消息，用量到达后单独记录。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::llm::TokenUsage;
use crate::memory::Message;

/// 按 slug 存储的会话消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredConversation {
    pub conversation_id: String,
    pub slug: String,
    pub messages: Vec<Message>,
}

/// 一次轮次的用量记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub conversation_id: String,
    pub generation: u64,
    pub usage: TokenUsage,
    pub recorded_at: DateTime<Utc>,
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn find_by_slug(&self, slug: &str) -> anyhow::Result<Option<StoredConversation>>;

    /// 追加消息；会话不存在时创建
    async fn persist_messages(
        &self,
        conversation_id: &str,
        slug: &str,
        messages: &[Message],
    ) -> anyhow::Result<()>;

    async fn persist_usage(&self, record: UsageRecord) -> anyhow::Result<()>;
}

/// 内存仓库
#[derive(Debug, Default)]
pub struct InMemoryMessageRepository {
    conversations: RwLock<HashMap<String, StoredConversation>>,
    usage: RwLock<Vec<UsageRecord>>,
}

impl InMemoryMessageRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预置一段历史（测试与导入用）
    pub async fn seed(&self, conversation_id: &str, slug: &str, messages: Vec<Message>) {
        self.conversations.write().await.insert(
            slug.to_string(),
            StoredConversation {
                conversation_id: conversation_id.to_string(),
                slug: slug.to_string(),
                messages,
            },
        );
    }

    pub async fn usage_records(&self) -> Vec<UsageRecord> {
        self.usage.read().await.clone()
    }
}

#[async_trait]
impl MessageRepository for InMemoryMessageRepository {
    async fn find_by_slug(&self, slug: &str) -> anyhow::Result<Option<StoredConversation>> {
        Ok(self.conversations.read().await.get(slug).cloned())
    }

    async fn persist_messages(
        &self,
        conversation_id: &str,
        slug: &str,
        messages: &[Message],
    ) -> anyhow::Result<()> {
        let mut conversations = self.conversations.write().await;
        let entry = conversations
            .entry(slug.to_string())
            .or_insert_with(|| StoredConversation {
                conversation_id: conversation_id.to_string(),
                slug: slug.to_string(),
                messages: Vec::new(),
            });
        entry.messages.extend_from_slice(messages);
        Ok(())
    }

    async fn persist_usage(&self, record: UsageRecord) -> anyhow::Result<()> {
        self.usage.write().await.push(record);
        Ok(())
    }
}
