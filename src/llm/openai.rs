//! OpenAI 兼容 API 提供方
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；支持 DeepSeek、OpenAI、自建代理等。
//! 模型名按调用传入，同一客户端可服务不同会话的不同模型。

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::llm::{usage_ready, ModelProvider, ModelResponse, ProviderError, TokenUsage};
use crate::memory::{Message, Role};

pub struct OpenAiProvider {
    client: Client<OpenAIConfig>,
}

impl OpenAiProvider {
    pub fn new(base_url: Option<&str>, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
        }
    }

    fn to_openai_messages(
        messages: &[Message],
    ) -> Result<Vec<ChatCompletionRequestMessage>, ProviderError> {
        let build_err = |e: async_openai::error::OpenAIError| ProviderError::Request(e.to_string());
        messages
            .iter()
            .map(|m| {
                Ok(match m.role {
                    Role::System => ChatCompletionRequestMessage::System(
                        ChatCompletionRequestSystemMessageArgs::default()
                            .content(m.content.clone())
                            .build()
                            .map_err(build_err)?,
                    ),
                    Role::User => ChatCompletionRequestMessage::User(
                        ChatCompletionRequestUserMessageArgs::default()
                            .content(m.content.clone())
                            .build()
                            .map_err(build_err)?,
                    ),
                    Role::Assistant => ChatCompletionRequestMessage::Assistant(
                        ChatCompletionRequestAssistantMessageArgs::default()
                            .content(m.content.clone())
                            .build()
                            .map_err(build_err)?,
                    ),
                })
            })
            .collect()
    }
}

#[async_trait]
impl ModelProvider for OpenAiProvider {
    async fn invoke(
        &self,
        messages: &[Message],
        model: &str,
    ) -> Result<ModelResponse, ProviderError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(model)
            .messages(Self::to_openai_messages(messages)?)
            .build()
            .map_err(|e| ProviderError::Request(e.to_string()))?;

        let response = self.client.chat().create(request).await.map_err(|e| {
            let msg = e.to_string();
            if msg.contains("429") || msg.to_lowercase().contains("rate limit") {
                ProviderError::RateLimited
            } else {
                ProviderError::Request(msg)
            }
        })?;

        let usage = response
            .usage
            .as_ref()
            .map(|u| TokenUsage::new(u.prompt_tokens as u64, u.completion_tokens as u64));

        let output = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or(ProviderError::EmptyResponse)?;

        Ok(ModelResponse {
            output,
            usage: usage_ready(usage),
        })
    }

    fn name(&self) -> &str {
        "openai-compatible"
    }
}
