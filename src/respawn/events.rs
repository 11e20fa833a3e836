//! 生命周期事件：以 `respawn:*` 命名，可序列化为 JSON 推给观察者

use serde::Serialize;
use tokio::sync::broadcast;

use super::action_log::ActionLogEntry;
use super::ai_check::AiVerdict;
use super::circuit_breaker::CircuitState;
use super::detection::DetectionSnapshot;
use super::state::{BlockReason, ControllerStatus, RespawnState, Step, StopReason};
use super::timers::Timer;

/// 事件通道容量
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all_fields = "camelCase")]
pub enum RespawnEvent {
    #[serde(rename = "respawn:started")]
    Started {
        session_id: String,
        status: Box<ControllerStatus>,
    },
    #[serde(rename = "respawn:stopped")]
    Stopped {
        session_id: String,
        reason: StopReason,
    },
    #[serde(rename = "respawn:stateChanged")]
    StateChanged {
        session_id: String,
        state: RespawnState,
    },
    #[serde(rename = "respawn:cycleStarted")]
    CycleStarted {
        session_id: String,
        cycle_number: u32,
    },
    #[serde(rename = "respawn:blocked")]
    Blocked {
        session_id: String,
        reason: BlockReason,
        details: String,
    },
    #[serde(rename = "respawn:stepSent")]
    StepSent {
        session_id: String,
        step: Step,
        input: String,
    },
    #[serde(rename = "respawn:autoAcceptSent")]
    AutoAcceptSent { session_id: String },
    #[serde(rename = "respawn:detectionUpdate")]
    DetectionUpdate {
        session_id: String,
        detection: DetectionSnapshot,
    },
    #[serde(rename = "respawn:aiCheckStarted")]
    AiCheckStarted { session_id: String },
    #[serde(rename = "respawn:aiCheckCompleted")]
    AiCheckCompleted {
        session_id: String,
        verdict: AiVerdict,
    },
    #[serde(rename = "respawn:aiCheckFailed")]
    AiCheckFailed { session_id: String, error: String },
    #[serde(rename = "respawn:aiCheckCooldown")]
    AiCheckCooldown {
        session_id: String,
        cooldown_ms: u64,
    },
    #[serde(rename = "respawn:timerStarted")]
    TimerStarted { session_id: String, timer: Timer },
    #[serde(rename = "respawn:timerCancelled")]
    TimerCancelled { session_id: String, timer: Timer },
    #[serde(rename = "respawn:timerCompleted")]
    TimerCompleted { session_id: String, timer: Timer },
    #[serde(rename = "respawn:circuitBreakerUpdate")]
    CircuitBreakerUpdate {
        session_id: String,
        state: CircuitState,
        reason: Option<String>,
    },
    #[serde(rename = "respawn:error")]
    Error { session_id: String, error: String },
    #[serde(rename = "respawn:actionLog")]
    ActionLog {
        session_id: String,
        action: ActionLogEntry,
    },
}

impl RespawnEvent {
    pub fn session_id(&self) -> &str {
        match self {
            RespawnEvent::Started { session_id, .. }
            | RespawnEvent::Stopped { session_id, .. }
            | RespawnEvent::StateChanged { session_id, .. }
            | RespawnEvent::CycleStarted { session_id, .. }
            | RespawnEvent::Blocked { session_id, .. }
            | RespawnEvent::StepSent { session_id, .. }
            | RespawnEvent::AutoAcceptSent { session_id }
            | RespawnEvent::DetectionUpdate { session_id, .. }
            | RespawnEvent::AiCheckStarted { session_id }
            | RespawnEvent::AiCheckCompleted { session_id, .. }
            | RespawnEvent::AiCheckFailed { session_id, .. }
            | RespawnEvent::AiCheckCooldown { session_id, .. }
            | RespawnEvent::TimerStarted { session_id, .. }
            | RespawnEvent::TimerCancelled { session_id, .. }
            | RespawnEvent::TimerCompleted { session_id, .. }
            | RespawnEvent::CircuitBreakerUpdate { session_id, .. }
            | RespawnEvent::Error { session_id, .. }
            | RespawnEvent::ActionLog { session_id, .. } => session_id,
        }
    }

    /// 事件名（与序列化后的 `event` 字段一致）
    pub fn name(&self) -> &'static str {
        match self {
            RespawnEvent::Started { .. } => "respawn:started",
            RespawnEvent::Stopped { .. } => "respawn:stopped",
            RespawnEvent::StateChanged { .. } => "respawn:stateChanged",
            RespawnEvent::CycleStarted { .. } => "respawn:cycleStarted",
            RespawnEvent::Blocked { .. } => "respawn:blocked",
            RespawnEvent::StepSent { .. } => "respawn:stepSent",
            RespawnEvent::AutoAcceptSent { .. } => "respawn:autoAcceptSent",
            RespawnEvent::DetectionUpdate { .. } => "respawn:detectionUpdate",
            RespawnEvent::AiCheckStarted { .. } => "respawn:aiCheckStarted",
            RespawnEvent::AiCheckCompleted { .. } => "respawn:aiCheckCompleted",
            RespawnEvent::AiCheckFailed { .. } => "respawn:aiCheckFailed",
            RespawnEvent::AiCheckCooldown { .. } => "respawn:aiCheckCooldown",
            RespawnEvent::TimerStarted { .. } => "respawn:timerStarted",
            RespawnEvent::TimerCancelled { .. } => "respawn:timerCancelled",
            RespawnEvent::TimerCompleted { .. } => "respawn:timerCompleted",
            RespawnEvent::CircuitBreakerUpdate { .. } => "respawn:circuitBreakerUpdate",
            RespawnEvent::Error { .. } => "respawn:error",
            RespawnEvent::ActionLog { .. } => "respawn:actionLog",
        }
    }
}

/// 事件发送端；没有订阅者时静默丢弃
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<RespawnEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: RespawnEvent) {
        tracing::trace!(event = event.name(), session = event.session_id(), "respawn event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RespawnEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_names() {
        let event = RespawnEvent::CycleStarted {
            session_id: "s1".to_string(),
            cycle_number: 3,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "respawn:cycleStarted");
        assert_eq!(json["sessionId"], "s1");
        assert_eq!(json["cycleNumber"], 3);
        assert_eq!(event.name(), "respawn:cycleStarted");
    }

    #[test]
    fn test_blocked_reason_wire_format() {
        let event = RespawnEvent::Blocked {
            session_id: "s1".to_string(),
            reason: BlockReason::CircuitBreakerOpen,
            details: "3 cycles".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["reason"], "circuit_breaker_open");
        assert_eq!(event.session_id(), "s1");
    }

    #[tokio::test]
    async fn test_sink_without_subscribers_does_not_fail() {
        let sink = EventSink::new(4);
        sink.emit(RespawnEvent::AiCheckStarted {
            session_id: "s1".to_string(),
        });
        let mut rx = sink.subscribe();
        sink.emit(RespawnEvent::AutoAcceptSent {
            session_id: "s1".to_string(),
        });
        assert_eq!(rx.recv().await.unwrap().name(), "respawn:autoAcceptSent");
    }
}
