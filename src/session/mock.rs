//! 内存会话（用于测试与演示，无需终端）
//!
//! 输出由调用方设置；send_input 记录下来，可选地回显输入、追加一段智能体回复，或报错。

use std::sync::Mutex;

use async_trait::async_trait;

use super::SessionIo;
use crate::core::SessionError;
use crate::respawn::ContextLimits;

#[derive(Debug, Default)]
struct MockState {
    output: String,
    sent: Vec<String>,
    limits: Option<ContextLimits>,
    echo_input: bool,
    reply: Option<String>,
    fail_sends: Option<SessionError>,
}

/// 内存会话：输出可控，记录所有输入
#[derive(Debug, Default)]
pub struct MockSession {
    state: Mutex<MockState>,
}

impl MockSession {
    pub fn new(output: impl Into<String>) -> Self {
        let session = Self::default();
        session.set_output(output);
        session
    }

    /// 发送的输入追加到输出（模拟终端回显，不代表智能体有进展）
    pub fn with_echo(self) -> Self {
        self.lock().echo_input = true;
        self
    }

    /// 每次输入后追加一行智能体回复
    pub fn with_reply(self, reply: impl Into<String>) -> Self {
        self.lock().reply = Some(reply.into());
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_output(&self, output: impl Into<String>) {
        self.lock().output = output.into();
    }

    pub fn append_output(&self, more: &str) {
        self.lock().output.push_str(more);
    }

    pub fn sent(&self) -> Vec<String> {
        self.lock().sent.clone()
    }

    pub fn limits(&self) -> Option<ContextLimits> {
        self.lock().limits.clone()
    }

    /// 之后所有 send_input 返回该错误
    pub fn fail_sends(&self, err: SessionError) {
        self.lock().fail_sends = Some(err);
    }
}

#[async_trait]
impl SessionIo for MockSession {
    async fn read_recent_output(&self, _session_id: &str) -> Result<String, SessionError> {
        Ok(self.lock().output.clone())
    }

    async fn send_input(&self, _session_id: &str, text: &str) -> Result<(), SessionError> {
        let mut state = self.lock();
        if let Some(err) = &state.fail_sends {
            return Err(err.clone());
        }
        state.sent.push(text.to_string());
        if state.echo_input {
            state.output.push('\n');
            state.output.push_str(text);
        }
        if let Some(reply) = state.reply.clone() {
            state.output.push_str("\n● ");
            state.output.push_str(&reply);
        }
        Ok(())
    }

    async fn set_context_limits(
        &self,
        _session_id: &str,
        limits: &ContextLimits,
    ) -> Result<(), SessionError> {
        self.lock().limits = Some(limits.clone());
        Ok(())
    }
}
