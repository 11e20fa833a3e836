//! 控制面：每个会话一个控制器，外加跨控制器生命周期保留的熔断器与动作日志
//!
//! 熔断器按会话保存在这里而不是控制器里：控制器因 OPEN 停止后，
//! 只有 reset_circuit_breaker 能让该会话重新 enable。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex, RwLock};

use super::action_log::{ActionLogEntry, ActionLogStore};
use super::ai_check::AiChecker;
use super::circuit_breaker::{CircuitBreaker, CircuitBreakerState};
use super::config::{validate_duration_minutes, AutomationConfig, RespawnPolicy};
use super::controller::{
    ControlCommand, ControllerHandle, ControllerMessage, ControllerParams, RespawnController,
};
use super::events::{EventSink, RespawnEvent};
use super::heuristic::{IdleHeuristic, PatternHeuristic};
use super::presets::{ConfigStore, CustomPreset, Preset};
use super::state::{ControllerStatus, StopReason};
use crate::core::RespawnError;
use crate::session::{HookEvent, SessionIo};

/// 为每个新控制器创建启发式
pub type HeuristicFactory = Arc<dyn Fn() -> Box<dyn IdleHeuristic> + Send + Sync>;

pub struct RespawnManager {
    session: Arc<dyn SessionIo>,
    checker: Option<Arc<dyn AiChecker>>,
    heuristic: HeuristicFactory,
    policy: RespawnPolicy,
    store: ConfigStore,
    controllers: RwLock<HashMap<String, ControllerHandle>>,
    breakers: RwLock<HashMap<String, Arc<Mutex<CircuitBreaker>>>>,
    action_log: Arc<ActionLogStore>,
    events: EventSink,
}

impl std::fmt::Debug for RespawnManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RespawnManager")
            .field("policy", &self.policy)
            .field("ai_check", &self.checker.is_some())
            .finish()
    }
}

impl RespawnManager {
    pub fn new(
        session: Arc<dyn SessionIo>,
        checker: Option<Arc<dyn AiChecker>>,
        policy: RespawnPolicy,
        store: ConfigStore,
    ) -> Self {
        let action_log = Arc::new(ActionLogStore::new(policy.action_log_capacity));
        Self {
            session,
            checker,
            heuristic: Arc::new(|| Box::new(PatternHeuristic::new()) as Box<dyn IdleHeuristic>),
            policy,
            store,
            controllers: RwLock::new(HashMap::new()),
            breakers: RwLock::new(HashMap::new()),
            action_log,
            events: EventSink::default(),
        }
    }

    /// 替换启发式实现（测试或自定义终端）
    pub fn with_heuristic(mut self, factory: HeuristicFactory) -> Self {
        self.heuristic = factory;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RespawnEvent> {
        self.events.subscribe()
    }

    pub fn policy(&self) -> &RespawnPolicy {
        &self.policy
    }

    async fn breaker(&self, session_id: &str) -> Arc<Mutex<CircuitBreaker>> {
        if let Some(breaker) = self.breakers.read().await.get(session_id) {
            return Arc::clone(breaker);
        }
        let mut breakers = self.breakers.write().await;
        Arc::clone(breakers.entry(session_id.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(CircuitBreaker::new(
                self.policy.half_open_after,
                self.policy.open_after,
            )))
        }))
    }

    /// 启用自动化：校验并保存配置，替换旧控制器，进入 watching
    ///
    /// `duration_minutes` 优先于配置里的 durationMinutes。
    pub async fn enable(
        &self,
        session_id: &str,
        config: AutomationConfig,
        duration_minutes: Option<u32>,
    ) -> Result<ControllerStatus, RespawnError> {
        let duration = duration_minutes.or(config.duration_minutes);
        if let Some(minutes) = duration {
            validate_duration_minutes(minutes)?;
        }
        config.validate()?;

        let breaker = self.breaker(session_id).await;
        if breaker.lock().await.is_open() {
            return Err(RespawnError::CircuitOpen(session_id.to_string()));
        }
        self.store.put(session_id, config.clone()).await?;

        let previous = self.controllers.write().await.remove(session_id);
        if let Some(previous) = previous {
            previous.stop(StopReason::Replaced).await;
        }

        if !config.context_limits.is_empty() {
            self.session
                .set_context_limits(session_id, &config.context_limits)
                .await?;
        }

        let handle = RespawnController::spawn(ControllerParams {
            session_id: session_id.to_string(),
            config,
            duration_minutes: duration,
            policy: self.policy.clone(),
            session: Arc::clone(&self.session),
            checker: self.checker.clone(),
            heuristic: (self.heuristic)(),
            breaker,
            events: self.events.clone(),
            action_log: Arc::clone(&self.action_log),
        })
        .await;
        let status = handle.status();
        self.controllers
            .write()
            .await
            .insert(session_id.to_string(), handle);
        Ok(status)
    }

    /// 套用 preset 后启用；preset 自带的时长可被参数覆盖
    pub async fn enable_with_preset(
        &self,
        session_id: &str,
        preset_id: &str,
        duration_minutes: Option<u32>,
    ) -> Result<ControllerStatus, RespawnError> {
        let preset = self
            .store
            .get_preset(preset_id)
            .await
            .ok_or_else(|| RespawnError::PresetNotFound(preset_id.to_string()))?;
        self.enable(session_id, preset.to_config(), duration_minutes)
            .await
    }

    /// 显式停止；返回最终状态
    pub async fn stop(&self, session_id: &str) -> Result<ControllerStatus, RespawnError> {
        let handle = self
            .controllers
            .write()
            .await
            .remove(session_id)
            .ok_or_else(|| RespawnError::NotEnabled(session_id.to_string()))?;
        Ok(handle.stop(StopReason::Manual).await)
    }

    /// 停止全部控制器（进程退出时）
    pub async fn stop_all(&self, reason: StopReason) -> usize {
        let handles: Vec<ControllerHandle> = self
            .controllers
            .write()
            .await
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        let count = handles.len();
        for handle in handles {
            handle.stop(reason).await;
        }
        count
    }

    /// 整体替换会话配置；运行中的控制器在下一个周期边界生效
    pub async fn update_config(
        &self,
        session_id: &str,
        config: AutomationConfig,
    ) -> Result<(), RespawnError> {
        self.store.put(session_id, config.clone()).await?;
        self.forward_config(session_id, config).await
    }

    async fn forward_config(
        &self,
        session_id: &str,
        config: AutomationConfig,
    ) -> Result<(), RespawnError> {
        if let Some(handle) = self.live_handle(session_id).await {
            if !config.context_limits.is_empty() {
                self.session
                    .set_context_limits(session_id, &config.context_limits)
                    .await?;
            }
            handle.send(ControllerMessage::Control(ControlCommand::UpdateConfig(
                config,
            )))?;
        }
        Ok(())
    }

    /// 熔断器回到 CLOSED；不会自行恢复自动化
    pub async fn reset_circuit_breaker(&self, session_id: &str) -> CircuitBreakerState {
        let breaker = self.breaker(session_id).await;
        let snapshot = {
            let mut breaker = breaker.lock().await;
            breaker.reset();
            breaker.snapshot()
        };
        tracing::info!("Circuit breaker reset for {}", session_id);
        self.events.emit(RespawnEvent::CircuitBreakerUpdate {
            session_id: session_id.to_string(),
            state: snapshot.state,
            reason: None,
        });
        snapshot
    }

    pub async fn circuit_breaker(&self, session_id: &str) -> CircuitBreakerState {
        self.breaker(session_id).await.lock().await.snapshot()
    }

    /// 投递 hook 到运行中的控制器
    pub async fn deliver_hook(&self, session_id: &str, hook: HookEvent) -> Result<(), RespawnError> {
        let handle = self
            .live_handle(session_id)
            .await
            .ok_or_else(|| RespawnError::NotEnabled(session_id.to_string()))?;
        handle.send(ControllerMessage::Hook(hook))
    }

    /// 智能体报告阻塞 → stopped(status_blocked)
    pub async fn report_blocked(&self, session_id: &str, details: &str) -> Result<(), RespawnError> {
        self.send_control(session_id, ControlCommand::ReportBlocked(details.to_string()))
            .await
    }

    /// 会话进程退出 → stopped(exit_signal)
    pub async fn report_exit(&self, session_id: &str, details: &str) -> Result<(), RespawnError> {
        self.send_control(session_id, ControlCommand::SessionExited(details.to_string()))
            .await
    }

    async fn send_control(
        &self,
        session_id: &str,
        command: ControlCommand,
    ) -> Result<(), RespawnError> {
        let handle = self
            .live_handle(session_id)
            .await
            .ok_or_else(|| RespawnError::NotEnabled(session_id.to_string()))?;
        handle.send(ControllerMessage::Control(command))
    }

    /// 最近一次状态快照；控制器自行停止后仍可查询其最终状态
    pub async fn status(&self, session_id: &str) -> Option<ControllerStatus> {
        self.controllers
            .read()
            .await
            .get(session_id)
            .map(ControllerHandle::status)
    }

    /// 仍在运行的会话
    pub async fn active_sessions(&self) -> Vec<String> {
        let mut sessions: Vec<String> = self
            .controllers
            .read()
            .await
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        sessions.sort();
        sessions
    }

    async fn live_handle(&self, session_id: &str) -> Option<ControllerHandleRef> {
        let controllers = self.controllers.read().await;
        let handle = controllers.get(session_id)?;
        (!handle.is_finished()).then(|| ControllerHandleRef {
            session_id: handle.session_id().to_string(),
            sender: handle.sender(),
        })
    }

    pub async fn action_log(&self, session_id: &str) -> Vec<ActionLogEntry> {
        self.action_log.list(session_id).await
    }

    pub async fn config(&self, session_id: &str) -> Option<AutomationConfig> {
        self.store.get(session_id).await
    }

    pub async fn list_presets(&self) -> Vec<Preset> {
        self.store.list_presets().await
    }

    pub async fn save_preset(
        &self,
        config: &AutomationConfig,
        name: &str,
        duration_minutes: Option<u32>,
    ) -> Result<CustomPreset, RespawnError> {
        self.store.save_preset(config, name, duration_minutes).await
    }

    pub async fn delete_preset(&self, id: &str) -> Result<CustomPreset, RespawnError> {
        self.store.delete_preset(id).await
    }

    /// 把 preset 复制进会话配置；运行中的控制器在周期边界生效
    pub async fn apply_preset(
        &self,
        session_id: &str,
        preset_id: &str,
    ) -> Result<AutomationConfig, RespawnError> {
        let config = self.store.apply_preset(session_id, preset_id).await?;
        self.forward_config(session_id, config.clone()).await?;
        Ok(config)
    }
}

/// 不持有 controllers 读锁的发送端
struct ControllerHandleRef {
    session_id: String,
    sender: tokio::sync::mpsc::UnboundedSender<ControllerMessage>,
}

impl ControllerHandleRef {
    fn send(&self, message: ControllerMessage) -> Result<(), RespawnError> {
        self.sender
            .send(message)
            .map_err(|_| RespawnError::ControllerGone(self.session_id.clone()))
    }
}
