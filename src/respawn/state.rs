//! 控制器状态：状态机状态、停止/阻塞原因、对外状态快照

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::circuit_breaker::CircuitBreakerState;
use super::detection::DetectionSnapshot;
use super::timers::Timer;

/// 状态机状态（字符串标签原样出现在外部事件中）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RespawnState {
    Stopped,
    Watching,
    ConfirmingIdle,
    AiChecking,
    SendingUpdate,
    WaitingUpdate,
    SendingClear,
    WaitingClear,
    SendingInit,
    WaitingInit,
    MonitoringInit,
    SendingKickstart,
    WaitingKickstart,
}

impl RespawnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RespawnState::Stopped => "stopped",
            RespawnState::Watching => "watching",
            RespawnState::ConfirmingIdle => "confirming_idle",
            RespawnState::AiChecking => "ai_checking",
            RespawnState::SendingUpdate => "sending_update",
            RespawnState::WaitingUpdate => "waiting_update",
            RespawnState::SendingClear => "sending_clear",
            RespawnState::WaitingClear => "waiting_clear",
            RespawnState::SendingInit => "sending_init",
            RespawnState::WaitingInit => "waiting_init",
            RespawnState::MonitoringInit => "monitoring_init",
            RespawnState::SendingKickstart => "sending_kickstart",
            RespawnState::WaitingKickstart => "waiting_kickstart",
        }
    }

    /// sending_* 状态
    pub fn is_sending(&self) -> bool {
        matches!(
            self,
            RespawnState::SendingUpdate
                | RespawnState::SendingClear
                | RespawnState::SendingInit
                | RespawnState::SendingKickstart
        )
    }

    /// waiting_* / monitoring_init：已发出输入，等待完成信号
    pub fn is_waiting(&self) -> bool {
        matches!(
            self,
            RespawnState::WaitingUpdate
                | RespawnState::WaitingClear
                | RespawnState::WaitingInit
                | RespawnState::WaitingKickstart
                | RespawnState::MonitoringInit
        )
    }

    /// 可接受新的检测输入（未在发送 / 等待中）
    pub fn is_detecting(&self) -> bool {
        matches!(
            self,
            RespawnState::Watching | RespawnState::ConfirmingIdle | RespawnState::AiChecking
        )
    }
}

impl fmt::Display for RespawnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一个周期内的脚本步骤
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Update,
    Clear,
    Init,
    Kickstart,
}

impl Step {
    pub fn sending_state(self) -> RespawnState {
        match self {
            Step::Update => RespawnState::SendingUpdate,
            Step::Clear => RespawnState::SendingClear,
            Step::Init => RespawnState::SendingInit,
            Step::Kickstart => RespawnState::SendingKickstart,
        }
    }

    pub fn waiting_state(self) -> RespawnState {
        match self {
            Step::Update => RespawnState::WaitingUpdate,
            Step::Clear => RespawnState::WaitingClear,
            Step::Init => RespawnState::WaitingInit,
            Step::Kickstart => RespawnState::WaitingKickstart,
        }
    }

    /// update / kickstart 完成即一个周期结束
    pub fn completes_cycle(self) -> bool {
        matches!(self, Step::Update | Step::Kickstart)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Step::Update => "update",
            Step::Clear => "clear",
            Step::Init => "init",
            Step::Kickstart => "kickstart",
        }
    }
}

/// 控制器停止原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Manual,
    DurationElapsed,
    CircuitBreakerOpen,
    ExitSignal,
    StatusBlocked,
    /// 重新 enable 时替换旧控制器
    Replaced,
    Shutdown,
}

/// respawn:blocked 的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    CircuitBreakerOpen,
    ExitSignal,
    StatusBlocked,
}

impl From<BlockReason> for StopReason {
    fn from(reason: BlockReason) -> Self {
        match reason {
            BlockReason::CircuitBreakerOpen => StopReason::CircuitBreakerOpen,
            BlockReason::ExitSignal => StopReason::ExitSignal,
            BlockReason::StatusBlocked => StopReason::StatusBlocked,
        }
    }
}

/// 控制器状态快照（每次变化后经 watch 通道发布）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerStatus {
    pub session_id: String,
    pub state: RespawnState,
    pub cycle_count: u32,
    pub started_at: DateTime<Utc>,
    pub circuit_breaker: CircuitBreakerState,
    pub detection: DetectionSnapshot,
    pub timers: Vec<Timer>,
    pub run_ends_at: Option<DateTime<Utc>>,
    pub stop_reason: Option<StopReason>,
}
