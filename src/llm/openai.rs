//! OpenAI 兼容 chat 端点（OpenAI / DeepSeek / 自建代理）
//!
//! 空闲确认每次只要一个单词，temperature 固定为 0，回复很短。

use std::sync::atomic::{AtomicU64, Ordering};

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::llm::{LlmClient, Message, Role};

pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";
pub const OPENAI_DEFAULT_MODEL: &str = "gpt-4o-mini";

pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    /// 累计 total_tokens，仅用于日志
    tokens_used: AtomicU64,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: &str) -> Self {
        let mut config = OpenAIConfig::new().with_api_key(api_key);
        if let Some(url) = base_url {
            config = config.with_api_base(url);
        }
        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            tokens_used: AtomicU64::new(0),
        }
    }

    /// DeepSeek 端点；模型未指定时读 `DEEPSEEK_MODEL`，再退回 deepseek-chat
    pub fn deepseek(model: Option<&str>, api_key: &str) -> Self {
        let model = model
            .map(String::from)
            .or_else(|| std::env::var("DEEPSEEK_MODEL").ok())
            .unwrap_or_else(|| DEEPSEEK_CHAT.to_string());
        Self::new(Some(DEEPSEEK_BASE_URL), &model, api_key)
    }

    pub fn tokens_used(&self) -> u64 {
        self.tokens_used.load(Ordering::Relaxed)
    }

    fn to_request_message(m: &Message) -> Result<ChatCompletionRequestMessage, String> {
        let msg = match m.role {
            Role::System => ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(m.content.clone())
                    .build()
                    .map_err(|e| e.to_string())?,
            ),
            Role::User => ChatCompletionRequestMessage::User(
                ChatCompletionRequestUserMessageArgs::default()
                    .content(m.content.clone())
                    .build()
                    .map_err(|e| e.to_string())?,
            ),
        };
        Ok(msg)
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        let messages = messages
            .iter()
            .map(Self::to_request_message)
            .collect::<Result<Vec<_>, _>>()?;
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .temperature(0.0)
            .messages(messages)
            .build()
            .map_err(|e| e.to_string())?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| format!("{} request failed: {}", self.model, e))?;

        if let Some(usage) = &response.usage {
            let total = self
                .tokens_used
                .fetch_add(u64::from(usage.total_tokens), Ordering::Relaxed)
                + u64::from(usage.total_tokens);
            tracing::debug!("Idle check used {} tokens ({} total)", usage.total_tokens, total);
        }

        response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| format!("{} returned an empty reply", self.model))
    }
}
