//! 自动续跑（respawn）控制器
//!
//! - **config / presets**: 会话配置、策略常量、preset 库
//! - **detection / heuristic / ai_check**: 空闲检测（hook > AI 确认 > 启发式）
//! - **controller**: 单会话状态机（actor）
//! - **circuit_breaker / timers / action_log**: 熔断、命名定时器、动作日志
//! - **manager**: 对外控制面

pub mod action_log;
pub mod ai_check;
pub mod circuit_breaker;
pub mod config;
pub mod controller;
pub mod detection;
pub mod events;
pub mod heuristic;
pub mod manager;
pub mod presets;
pub mod state;
pub mod timers;

pub use action_log::{ActionKind, ActionLogEntry, ActionLogStore, DEFAULT_ACTION_LOG_CAPACITY};
pub use ai_check::{AiChecker, AiVerdict, LlmIdleChecker};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerState, CircuitState};
pub use config::{AutomationConfig, ContextLimits, RespawnPolicy};
pub use controller::{ControlCommand, ControllerHandle, ControllerMessage, RespawnController};
pub use detection::{AiCheckStatus, DetectionSnapshot, DetectionSource, HookSignal};
pub use events::{EventSink, RespawnEvent};
pub use heuristic::{HeuristicScore, IdleHeuristic, PatternHeuristic};
pub use manager::{HeuristicFactory, RespawnManager};
pub use presets::{BuiltInPreset, ConfigStore, CustomPreset, Preset, PresetLibrary};
pub use state::{BlockReason, ControllerStatus, RespawnState, Step, StopReason};
pub use timers::{Timer, TimerManager};
