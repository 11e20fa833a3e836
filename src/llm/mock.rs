//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 返回预设回复（默认 "IDLE"），并记录最近一次收到的消息，便于断言 prompt 内容。

use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, Message};

/// Mock 客户端：固定回复
#[derive(Debug)]
pub struct MockLlmClient {
    reply: Result<String, String>,
    last: Mutex<Vec<Message>>,
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self::with_reply("IDLE")
    }
}

impl MockLlmClient {
    pub fn with_reply(reply: impl Into<String>) -> Self {
        Self {
            reply: Ok(reply.into()),
            last: Mutex::new(Vec::new()),
        }
    }

    /// 每次调用都返回错误
    pub fn failing(error: impl Into<String>) -> Self {
        Self {
            reply: Err(error.into()),
            last: Mutex::new(Vec::new()),
        }
    }

    pub fn last_messages(&self) -> Vec<Message> {
        self.last.lock().map(|m| m.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    fn model(&self) -> &str {
        "mock"
    }

    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        if let Ok(mut last) = self.last.lock() {
            *last = messages.to_vec();
        }
        self.reply.clone()
    }
}
