//! Mock 模型（用于测试与本地运行，无需 API）
//!
//! 遇到意图分类提示时按关键词给出 JSON 分类；其余请求回显最后一条 User 消息。

use async_trait::async_trait;

use crate::llm::{usage_ready, ModelProvider, ModelResponse, ProviderError, TokenUsage};
use crate::memory::{last_user_message, Message, Role};
use crate::subtask::CLASSIFY_SYSTEM_PROMPT;

/// Mock 提供方：确定性输出，用量按词数估算
#[derive(Debug, Default)]
pub struct MockProvider;

impl MockProvider {
    fn classify(input: &str) -> &'static str {
        let lower = input.to_lowercase();
        // 按整词匹配，避免 "sushi" 命中 "hi"
        let words: Vec<&str> = lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();
        let has_word = |candidates: &[&str]| candidates.iter().any(|c| words.contains(c));
        let has_any = |phrases: &[&str]| phrases.iter().any(|p| lower.contains(p));

        if has_word(&["hello", "hi", "hey"]) || has_any(&["good morning", "你好"]) {
            r#"{"intent": "greeting"}"#
        } else if has_any(&["version", "which model", "system", "about you"]) {
            r#"{"intent": "system"}"#
        } else if has_any(&["chart", "plot", "graph"]) {
            r#"{"intent": "read-data", "needs_chart": true, "needs_sql": true}"#
        } else if has_any(&["how many", "select", "count", "show me", "list all", "top "]) {
            r#"{"intent": "read-data", "needs_sql": true}"#
        } else {
            r#"{"intent": "other"}"#
        }
    }
}

#[async_trait]
impl ModelProvider for MockProvider {
    async fn invoke(
        &self,
        messages: &[Message],
        _model: &str,
    ) -> Result<ModelResponse, ProviderError> {
        let last_user = last_user_message(messages)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");

        let is_classification = messages
            .iter()
            .any(|m| m.role == Role::System && m.content == CLASSIFY_SYSTEM_PROMPT);

        let output = if is_classification {
            Self::classify(last_user).to_string()
        } else {
            format!("Echo from Mock: {last_user}")
        };

        let prompt_tokens = messages
            .iter()
            .map(|m| m.content.split_whitespace().count() as u64)
            .sum();
        let completion_tokens = output.split_whitespace().count() as u64;

        Ok(ModelResponse {
            output,
            usage: usage_ready(Some(TokenUsage::new(prompt_tokens, completion_tokens))),
        })
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subtask::parse_intent;
    use crate::subtask::IntentKind;

    async fn classify(text: &str) -> IntentKind {
        let messages = vec![Message::system(CLASSIFY_SYSTEM_PROMPT), Message::user(text)];
        let response = MockProvider.invoke(&messages, "mock").await.unwrap();
        parse_intent(&response.output).unwrap().kind
    }

    #[tokio::test]
    async fn test_mock_classification() {
        assert_eq!(classify("hello there").await, IntentKind::Greeting);
        assert_eq!(classify("how many orders last week?").await, IntentKind::ReadData);
        assert_eq!(classify("which model are you").await, IntentKind::System);
        assert_eq!(classify("explain this notebook").await, IntentKind::Other);
    }

    #[tokio::test]
    async fn test_greeting_words_match_whole_words_only() {
        assert_eq!(classify("hi").await, IntentKind::Greeting);
        assert_eq!(classify("Hi, can you help?").await, IntentKind::Greeting);
        assert_eq!(classify("sushi menu ideas").await, IntentKind::Other);
        assert_eq!(classify("this is the shipment").await, IntentKind::Other);
    }

    #[tokio::test]
    async fn test_mock_echo_with_usage() {
        let response = MockProvider
            .invoke(&[Message::user("ping pong")], "mock")
            .await
            .unwrap();
        assert_eq!(response.output, "Echo from Mock: ping pong");
        let usage = response.usage.await.unwrap();
        assert_eq!(usage.prompt_tokens, 2);
        assert_eq!(usage.completion_tokens, 5);
    }
}
