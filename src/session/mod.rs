//! 会话协作方接口
//!
//! 控制器只通过 SessionIo 接触终端：读取最近输出、发送输入、调整 token 阈值监视器。
//! 渲染、进程生命周期、多路复用器管理都在本 crate 之外。

pub mod ansi;
pub mod mock;
pub mod tmux;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::SessionError;
use crate::respawn::ContextLimits;

pub use ansi::{fingerprint, progress_fingerprint, strip_ansi};
pub use mock::MockSession;
pub use tmux::TmuxSession;

/// 会话 I/O：每次 send_input 必须完整、原子地写入，之后其他发送方才能继续
#[async_trait]
pub trait SessionIo: Send + Sync {
    /// 最近一屏（或一段）终端输出
    async fn read_recent_output(&self, session_id: &str) -> Result<String, SessionError>;

    /// 发送一段输入（含提交），返回即视为已确认
    async fn send_input(&self, session_id: &str, text: &str) -> Result<(), SessionError>;

    /// 配置自动压缩 / 自动清空阈值；默认不支持则忽略
    async fn set_context_limits(
        &self,
        _session_id: &str,
        _limits: &ContextLimits,
    ) -> Result<(), SessionError> {
        Ok(())
    }
}

/// 智能体生命周期 hook 推送的事件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookEvent {
    IdlePrompt,
    PermissionPrompt,
    ElicitationDialog,
    Stop,
}

impl HookEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookEvent::IdlePrompt => "idle_prompt",
            HookEvent::PermissionPrompt => "permission_prompt",
            HookEvent::ElicitationDialog => "elicitation_dialog",
            HookEvent::Stop => "stop",
        }
    }

    /// idle_prompt / stop 是权威的空闲信号
    pub fn signals_idle(&self) -> bool {
        matches!(self, HookEvent::IdlePrompt | HookEvent::Stop)
    }
}

impl std::str::FromStr for HookEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "idle_prompt" => Ok(HookEvent::IdlePrompt),
            "permission_prompt" => Ok(HookEvent::PermissionPrompt),
            "elicitation_dialog" => Ok(HookEvent::ElicitationDialog),
            "stop" => Ok(HookEvent::Stop),
            other => Err(format!("unknown hook event: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_parse() {
        assert_eq!("stop".parse::<HookEvent>(), Ok(HookEvent::Stop));
        assert_eq!(
            " idle_prompt ".parse::<HookEvent>(),
            Ok(HookEvent::IdlePrompt)
        );
        assert!("nope".parse::<HookEvent>().is_err());
        assert!(HookEvent::Stop.signals_idle());
        assert!(!HookEvent::PermissionPrompt.signals_idle());
    }
}
