//! 模型层：提供方抽象与实现（OpenAI 兼容 / Mock）

pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;

pub use mock::MockProvider;
pub use openai::OpenAiProvider;
pub use traits::{
    usage_channel, usage_ready, ModelProvider, ModelResponse, ProviderError, TokenUsage,
    UsageFuture,
};

use crate::config::AppConfig;

/// DeepSeek 的 OpenAI 兼容端点
const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";

/// 根据配置与环境变量选择模型提供方（DeepSeek / OpenAI 兼容 / Mock）
pub fn create_provider_from_config(cfg: &AppConfig) -> Arc<dyn ModelProvider> {
    let provider = cfg.llm.provider.to_lowercase();
    let deepseek_key = std::env::var("DEEPSEEK_API_KEY").ok();
    let openai_key = std::env::var("OPENAI_API_KEY").ok();

    match provider.as_str() {
        "deepseek" if deepseek_key.is_some() || openai_key.is_some() => {
            let base = cfg.llm.base_url.as_deref().unwrap_or(DEEPSEEK_BASE_URL);
            tracing::info!("Using DeepSeek provider ({})", base);
            Arc::new(OpenAiProvider::new(
                Some(base),
                deepseek_key.or(openai_key).as_deref(),
            ))
        }
        "openai" if openai_key.is_some() => {
            tracing::info!("Using OpenAI-compatible provider");
            Arc::new(OpenAiProvider::new(
                cfg.llm.base_url.as_deref(),
                openai_key.as_deref(),
            ))
        }
        _ => {
            tracing::warn!("No API key set or provider '{}' unknown, using Mock provider", provider);
            Arc::new(MockProvider)
        }
    }
}
