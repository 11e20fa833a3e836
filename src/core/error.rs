//! 错误类型
//!
//! RespawnError 是控制面（enable / stop / preset CRUD）的统一错误；SessionError 来自会话协作方（读输出、发输入）。
//! AI 确认失败不在此列：它只会把检测快照标记为 disabled，不会以错误形式冒泡。

use thiserror::Error;

/// 控制面与配置存储返回的错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RespawnError {
    /// 配置或 preset 负载不合法，在进入状态机之前就被拒绝
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// 内置 preset 不可修改/删除
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Preset not found: {0}")]
    PresetNotFound(String),

    /// 该会话未启用自动化
    #[error("Automation not enabled for session {0}")]
    NotEnabled(String),

    /// 熔断器处于 OPEN，需先 reset 才能重新启用
    #[error("Circuit breaker open for session {0}; reset required")]
    CircuitOpen(String),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Persistence error: {0}")]
    Persistence(String),

    /// 控制器任务已退出（收件箱关闭）
    #[error("Controller for session {0} is gone")]
    ControllerGone(String),
}

/// 会话协作方（终端 / 多路复用器）的错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session I/O failed: {0}")]
    Io(String),

    /// 底层进程已退出，不可恢复
    #[error("Session exited: {0}")]
    Exited(String),

    #[error("Input rejected: {0}")]
    Rejected(String),
}

impl From<toml::de::Error> for RespawnError {
    fn from(e: toml::de::Error) -> Self {
        RespawnError::Persistence(e.to_string())
    }
}

impl From<toml::ser::Error> for RespawnError {
    fn from(e: toml::ser::Error) -> Self {
        RespawnError::Persistence(e.to_string())
    }
}

impl From<std::io::Error> for RespawnError {
    fn from(e: std::io::Error) -> Self {
        RespawnError::Persistence(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_error_converts() {
        let err: RespawnError = SessionError::Exited("pane closed".to_string()).into();
        assert!(matches!(err, RespawnError::Session(SessionError::Exited(_))));
        assert!(err.to_string().contains("pane closed"));
    }

    #[test]
    fn test_io_error_is_persistence() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: RespawnError = io.into();
        assert!(matches!(err, RespawnError::Persistence(_)));
    }
}
