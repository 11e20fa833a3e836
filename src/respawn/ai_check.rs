//! AI 空闲确认
//!
//! 把智能体最近的 transcript 交给 LLM，让它只回答 IDLE 或 WORKING。
//! 超时、panic、无法解析的回复都算失败；失败由检测引擎吸收，不会传到状态机之外。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};

use crate::llm::{LlmClient, Message};
use crate::session::strip_ansi;

/// AI 判定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AiVerdict {
    Idle,
    Working,
}

impl AiVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            AiVerdict::Idle => "IDLE",
            AiVerdict::Working => "WORKING",
        }
    }

    /// 从模型回复中解析判定：取第一个出现的关键字
    pub fn parse(reply: &str) -> Option<Self> {
        let upper = reply.to_uppercase();
        match (upper.find("IDLE"), upper.find("WORKING")) {
            (Some(i), Some(w)) => Some(if i < w { AiVerdict::Idle } else { AiVerdict::Working }),
            (Some(_), None) => Some(AiVerdict::Idle),
            (None, Some(_)) => Some(AiVerdict::Working),
            (None, None) => None,
        }
    }
}

/// AI 确认接口
#[async_trait]
pub trait AiChecker: Send + Sync {
    async fn check(&self, transcript: &str) -> Result<AiVerdict, String>;
}

const IDLE_CHECK_PROMPT: &str = "You are monitoring an interactive CLI coding agent through its terminal output. \
Decide whether the agent has finished its current turn and is waiting for input (IDLE), \
or is still producing output, running tools, or thinking (WORKING). \
Answer with exactly one word: IDLE or WORKING.";

/// 基于 LlmClient 的实现
pub struct LlmIdleChecker {
    llm: Arc<dyn LlmClient>,
    max_transcript_chars: usize,
}

impl LlmIdleChecker {
    pub fn new(llm: Arc<dyn LlmClient>, max_transcript_chars: usize) -> Self {
        Self {
            llm,
            max_transcript_chars: max_transcript_chars.max(256),
        }
    }

    /// 只保留尾部，按字符边界截断
    fn tail<'a>(&self, transcript: &'a str) -> &'a str {
        let total = transcript.chars().count();
        if total <= self.max_transcript_chars {
            return transcript;
        }
        let skip = total - self.max_transcript_chars;
        let start = transcript
            .char_indices()
            .nth(skip)
            .map(|(i, _)| i)
            .unwrap_or(0);
        &transcript[start..]
    }
}

#[async_trait]
impl AiChecker for LlmIdleChecker {
    async fn check(&self, transcript: &str) -> Result<AiVerdict, String> {
        let clean = strip_ansi(transcript);
        let messages = vec![
            Message::system(IDLE_CHECK_PROMPT),
            Message::user(format!(
                "Terminal output (most recent last):\n```\n{}\n```",
                self.tail(&clean)
            )),
        ];
        let reply = self.llm.complete(&messages).await?;
        AiVerdict::parse(&reply)
            .ok_or_else(|| format!("unparseable AI verdict: {}", reply.trim()))
    }
}

/// 带超时并捕获 panic 地执行一次确认
pub async fn run_ai_check(
    checker: Arc<dyn AiChecker>,
    transcript: String,
    timeout: Duration,
) -> Result<AiVerdict, String> {
    let fut = AssertUnwindSafe(async move { checker.check(&transcript).await }).catch_unwind();
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err("AI check crashed".to_string()),
        Err(_) => Err(format!("AI check timed out after {}s", timeout.as_secs())),
    }
}
