use async_trait::async_trait;

use super::Message;

/// 一次性非流式对话；错误以字符串返回，由调用方决定退避
#[async_trait]
pub trait LlmClient: Send + Sync {
    fn model(&self) -> &str;

    /// 返回首条回复内容；空回复视为错误
    async fn complete(&self, messages: &[Message]) -> Result<String, String>;
}
