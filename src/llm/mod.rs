//! LLM 层：AI 空闲确认用到的最小客户端抽象（OpenAI 兼容端点 / Mock）

pub mod message;
pub mod mock;
pub mod openai;
pub mod traits;

pub use message::{Message, Role};
pub use mock::MockLlmClient;
pub use openai::{OpenAiClient, DEEPSEEK_CHAT, OPENAI_DEFAULT_MODEL};
pub use traits::LlmClient;
