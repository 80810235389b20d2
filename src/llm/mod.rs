//! LLM 层：客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock），以及基于 LLM 的工作单元

pub mod mock;
pub mod openai;
pub mod traits;
pub mod work;

use std::sync::Arc;

use crate::config::AppConfig;

pub use mock::MockLlmClient;
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{LlmClient, LlmError, Message, Role};
pub use work::LlmWork;

/// DeepSeek 的 OpenAI 兼容端点
pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";

const OPENAI_DEFAULT_MODEL: &str = "gpt-4o-mini";

/// DeepSeek 模型：[llm.deepseek].model > DEEPSEEK_MODEL 环境变量 > [llm].model
fn deepseek_model(cfg: &AppConfig) -> String {
    cfg.llm
        .deepseek
        .model
        .clone()
        .or_else(|| std::env::var("DEEPSEEK_MODEL").ok())
        .unwrap_or_else(|| cfg.llm.model.clone())
}

/// DeepSeek 客户端：Key 取 DEEPSEEK_API_KEY，其次 OPENAI_API_KEY；[llm].base_url 可指向代理
fn deepseek_client(cfg: &AppConfig) -> OpenAiClient {
    let api_key = std::env::var("DEEPSEEK_API_KEY")
        .ok()
        .or_else(|| std::env::var("OPENAI_API_KEY").ok());
    let base = cfg.llm.base_url.as_deref().unwrap_or(DEEPSEEK_BASE_URL);
    OpenAiClient::new(Some(base), &deepseek_model(cfg), api_key.as_deref())
        .with_request_timeout(cfg.llm.timeouts.request)
}

/// 根据配置与环境变量选择 LLM 后端（DeepSeek / OpenAI 兼容 / Mock）
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    if provider == "mock" {
        tracing::info!("Using Mock LLM (configured)");
        return Arc::new(MockLlmClient);
    }

    // 有 DeepSeek Key 或（配置为 deepseek 且仅有 OpenAI Key 时也走 DeepSeek 兼容端点）
    let use_deepseek = std::env::var("DEEPSEEK_API_KEY").is_ok()
        || (provider == "deepseek" && std::env::var("OPENAI_API_KEY").is_ok());
    let use_openai = std::env::var("OPENAI_API_KEY").is_ok() && provider != "deepseek";

    if use_deepseek {
        let client = deepseek_client(cfg);
        tracing::info!("Using DeepSeek LLM ({})", client.model());
        Arc::new(client)
    } else if use_openai {
        let model = cfg
            .llm
            .openai
            .model
            .clone()
            .unwrap_or_else(|| OPENAI_DEFAULT_MODEL.to_string());
        tracing::info!("Using OpenAI LLM ({})", model);
        Arc::new(
            OpenAiClient::new(cfg.llm.base_url.as_deref(), &model, None)
                .with_request_timeout(cfg.llm.timeouts.request),
        )
    } else {
        tracing::warn!("No API key set or provider unknown, using Mock LLM");
        Arc::new(MockLlmClient)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deepseek_section_model_wins() {
        let mut cfg = AppConfig::default();
        cfg.llm.deepseek.model = Some("deepseek-reasoner".to_string());
        assert_eq!(deepseek_model(&cfg), "deepseek-reasoner");
        assert_eq!(deepseek_client(&cfg).model(), "deepseek-reasoner");
    }

    #[tokio::test]
    async fn test_mock_provider_is_honoured() {
        let mut cfg = AppConfig::default();
        cfg.llm.provider = "Mock".to_string();
        let llm = create_llm_from_config(&cfg);
        let out = llm.complete(&[Message::user("ping")]).await.unwrap();
        assert_eq!(out, "Mock answer: ping");
        assert_eq!(llm.token_usage(), (0, 0, 0));
    }
}
