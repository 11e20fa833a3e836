//! tmux 会话适配器
//!
//! 会话 ID 即 tmux 目标（`session:window.pane`）。输出用 `capture-pane` 读取最近若干行，
//! 输入用 `send-keys -l` 按字面发送后再补一个 Enter；同一会话的发送由内部锁串行化，
//! 保证一次输入完整写完才轮到下一个发送方。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;

use super::SessionIo;
use crate::core::SessionError;
use crate::respawn::ContextLimits;

/// 默认回溯行数
const DEFAULT_HISTORY_LINES: u32 = 200;

/// 通过 tmux 驱动的会话
#[derive(Debug)]
pub struct TmuxSession {
    history_lines: u32,
    send_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    limits: Mutex<HashMap<String, ContextLimits>>,
}

impl TmuxSession {
    pub fn new() -> Self {
        Self {
            history_lines: DEFAULT_HISTORY_LINES,
            send_locks: Mutex::new(HashMap::new()),
            limits: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_history_lines(mut self, lines: u32) -> Self {
        self.history_lines = lines.max(1);
        self
    }

    /// 检查 tmux 是否可用
    pub async fn available() -> bool {
        Command::new("tmux")
            .arg("-V")
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// 最近一次为该会话设置的 token 阈值
    pub async fn context_limits(&self, target: &str) -> Option<ContextLimits> {
        self.limits.lock().await.get(target).cloned()
    }

    async fn send_lock(&self, target: &str) -> Arc<Mutex<()>> {
        let mut locks = self.send_locks.lock().await;
        Arc::clone(locks.entry(target.to_string()).or_default())
    }

    async fn tmux(args: &[&str]) -> Result<String, SessionError> {
        let output = Command::new("tmux")
            .args(args)
            .output()
            .await
            .map_err(|e| SessionError::Io(format!("tmux {} failed: {e}", args[0])))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            // 目标 pane 不存在 = 底层进程已退出
            if stderr.contains("can't find") || stderr.contains("no server running") {
                return Err(SessionError::Exited(stderr));
            }
            return Err(SessionError::Io(format!(
                "tmux {} exited with {}: {stderr}",
                args[0], output.status
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for TmuxSession {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionIo for TmuxSession {
    async fn read_recent_output(&self, session_id: &str) -> Result<String, SessionError> {
        let start = format!("-{}", self.history_lines);
        Self::tmux(&["capture-pane", "-p", "-e", "-t", session_id, "-S", &start]).await
    }

    async fn send_input(&self, session_id: &str, text: &str) -> Result<(), SessionError> {
        let lock = self.send_lock(session_id).await;
        let _guard = lock.lock().await;
        if !text.is_empty() && text != "\r" {
            Self::tmux(&["send-keys", "-t", session_id, "-l", text]).await?;
        }
        Self::tmux(&["send-keys", "-t", session_id, "Enter"]).await?;
        tracing::debug!("Sent {} chars to tmux target {}", text.len(), session_id);
        Ok(())
    }

    async fn set_context_limits(
        &self,
        session_id: &str,
        limits: &ContextLimits,
    ) -> Result<(), SessionError> {
        // tmux 本身没有 token 概念，记录下来供上层的阈值监视器读取
        self.limits
            .lock()
            .await
            .insert(session_id.to_string(), limits.clone());
        Ok(())
    }
}
