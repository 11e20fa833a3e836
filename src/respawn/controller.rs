//! 单会话控制器：一个 tokio 任务 + 一个收件箱
//!
//! hook、AI 确认结果、定时器到期、控制命令都作为消息进入同一个 mpsc 收件箱，
//! 轮询节拍由 select! 内的 interval 提供。所有状态转换都在这一个任务里串行执行，
//! 同一会话的两个转换永远不会并发。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::action_log::{ActionKind, ActionLogEntry, ActionLogStore};
use super::ai_check::{run_ai_check, AiChecker, AiVerdict};
use super::circuit_breaker::{BreakerTransition, CircuitBreaker};
use super::config::{AutomationConfig, RespawnPolicy};
use super::detection::{AiOutcome, DetectionEngine, DetectionSnapshot, Verdict};
use super::events::{EventSink, RespawnEvent};
use super::heuristic::IdleHeuristic;
use super::state::{BlockReason, ControllerStatus, RespawnState, Step, StopReason};
use super::timers::{ExpireCallback, Timer, TimerFired, TimerManager};
use crate::core::{RespawnError, SessionError};
use crate::session::{progress_fingerprint, HookEvent, SessionIo};

pub const TIMER_RUN_DURATION: &str = "run-duration";
pub const TIMER_IDLE_CONFIRM: &str = "idle-confirm";
pub const TIMER_STEP_DELAY: &str = "step-delay";
pub const TIMER_STEP_TIMEOUT: &str = "step-timeout";
pub const TIMER_INIT_MONITOR: &str = "init-monitor";
pub const TIMER_AI_COOLDOWN: &str = "ai-cooldown";

/// 自动确认权限提示时发送的按键
const AUTO_ACCEPT_INPUT: &str = "\r";
const CLEAR_COMMAND: &str = "/clear";
const INIT_COMMAND: &str = "/init";

/// 外部控制命令
#[derive(Debug, Clone)]
pub enum ControlCommand {
    Stop(StopReason),
    /// 在下一次进入 watching 时生效
    UpdateConfig(AutomationConfig),
    /// 会话进程退出或不可恢复的错误
    SessionExited(String),
    /// 智能体主动报告阻塞
    ReportBlocked(String),
}

/// 收件箱消息
#[derive(Debug)]
pub enum ControllerMessage {
    Hook(HookEvent),
    AiResult {
        generation: u64,
        result: Result<AiVerdict, String>,
    },
    TimerFired(TimerFired),
    Control(ControlCommand),
}

/// 启动控制器所需的一切
pub struct ControllerParams {
    pub session_id: String,
    pub config: AutomationConfig,
    pub duration_minutes: Option<u32>,
    pub policy: RespawnPolicy,
    pub session: Arc<dyn SessionIo>,
    pub checker: Option<Arc<dyn AiChecker>>,
    pub heuristic: Box<dyn IdleHeuristic>,
    pub breaker: Arc<Mutex<CircuitBreaker>>,
    pub events: EventSink,
    pub action_log: Arc<ActionLogStore>,
}

/// 控制器句柄：收件箱发送端 + 状态快照 + 任务句柄
#[derive(Debug)]
pub struct ControllerHandle {
    session_id: String,
    tx: mpsc::UnboundedSender<ControllerMessage>,
    status: watch::Receiver<ControllerStatus>,
    task: JoinHandle<()>,
}

impl ControllerHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn send(&self, message: ControllerMessage) -> Result<(), RespawnError> {
        self.tx
            .send(message)
            .map_err(|_| RespawnError::ControllerGone(self.session_id.clone()))
    }

    pub(crate) fn sender(&self) -> mpsc::UnboundedSender<ControllerMessage> {
        self.tx.clone()
    }

    pub fn status(&self) -> ControllerStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ControllerStatus> {
        self.status.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// 发送停止命令并等待任务退出
    pub async fn stop(self, reason: StopReason) -> ControllerStatus {
        let _ = self.tx.send(ControllerMessage::Control(ControlCommand::Stop(reason)));
        if let Err(e) = self.task.await {
            tracing::warn!("Controller task for {} ended abnormally: {}", self.session_id, e);
        }
        let status = self.status.borrow().clone();
        status
    }
}

/// 会话控制器（状态机本体）
pub struct RespawnController {
    session_id: String,
    config: AutomationConfig,
    pending_config: Option<AutomationConfig>,
    policy: RespawnPolicy,
    state: RespawnState,
    cycle_count: u32,
    started_at: DateTime<Utc>,
    run_ends_at: Option<DateTime<Utc>>,
    stop_reason: Option<StopReason>,
    detection: DetectionEngine,
    last_detection: DetectionSnapshot,
    timers: TimerManager,
    breaker: Arc<Mutex<CircuitBreaker>>,
    session: Arc<dyn SessionIo>,
    checker: Option<Arc<dyn AiChecker>>,
    ai_task: Option<JoinHandle<()>>,
    inbox: mpsc::WeakUnboundedSender<ControllerMessage>,
    events: EventSink,
    action_log: Arc<ActionLogStore>,
    status_tx: watch::Sender<ControllerStatus>,
    last_output: String,
    current_step: Option<Step>,
    /// 发送前的进度指纹与发送的输入
    baseline: Option<(u64, String)>,
    step_delay_elapsed: bool,
    elicitation_pending: bool,
}

impl RespawnController {
    /// 创建控制器并在后台运行；返回时已进入 watching
    pub async fn spawn(params: ControllerParams) -> ControllerHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let inbox = tx.downgrade();

        let timer_inbox = inbox.clone();
        let on_expire: ExpireCallback = Arc::new(move |fired| {
            if let Some(tx) = timer_inbox.upgrade() {
                let _ = tx.send(ControllerMessage::TimerFired(fired));
            }
        });

        let ai_available = params.checker.is_some();
        let detection =
            DetectionEngine::with_heuristic(&params.policy, ai_available, params.heuristic);
        let last_detection = detection.idle_snapshot(Instant::now());
        let started_at = Utc::now();
        let circuit_breaker = params.breaker.lock().await.snapshot();

        let initial = ControllerStatus {
            session_id: params.session_id.clone(),
            state: RespawnState::Stopped,
            cycle_count: 0,
            started_at,
            circuit_breaker,
            detection: last_detection.clone(),
            timers: Vec::new(),
            run_ends_at: None,
            stop_reason: None,
        };
        let (status_tx, status_rx) = watch::channel(initial);

        let mut controller = RespawnController {
            session_id: params.session_id.clone(),
            timers: TimerManager::new(params.session_id.clone(), on_expire),
            config: params.config,
            pending_config: None,
            policy: params.policy,
            state: RespawnState::Stopped,
            cycle_count: 0,
            started_at,
            run_ends_at: None,
            stop_reason: None,
            detection,
            last_detection,
            breaker: params.breaker,
            session: params.session,
            checker: params.checker,
            ai_task: None,
            inbox,
            events: params.events,
            action_log: params.action_log,
            status_tx,
            last_output: String::new(),
            current_step: None,
            baseline: None,
            step_delay_elapsed: false,
            elicitation_pending: false,
        };

        controller.start(params.duration_minutes).await;
        let task = tokio::spawn(controller.run(rx));

        ControllerHandle {
            session_id: params.session_id,
            tx,
            status: status_rx,
            task,
        }
    }

    async fn start(&mut self, duration_minutes: Option<u32>) {
        if let Some(minutes) = duration_minutes {
            let timer = self.start_timer(
                TIMER_RUN_DURATION,
                Duration::from_secs(u64::from(minutes) * 60),
                "duration elapsed",
            );
            self.run_ends_at = Some(timer.ends_at);
        }
        tracing::info!(
            "Respawn enabled for {} (duration: {:?} min)",
            self.session_id,
            duration_minutes
        );
        self.transition(RespawnState::Watching).await;
        let status = self.current_status().await;
        self.events.emit(RespawnEvent::Started {
            session_id: self.session_id.clone(),
            status: Box::new(status),
        });
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ControllerMessage>) {
        let mut poll = self.policy.poll_interval(&self.config);
        let mut tick = new_interval(poll);

        while self.state != RespawnState::Stopped {
            tokio::select! {
                message = rx.recv() => match message {
                    Some(message) => self.handle(message).await,
                    None => self.halt(StopReason::Shutdown).await,
                },
                _ = tick.tick() => self.on_tick().await,
            }

            let wanted = self.policy.poll_interval(&self.config);
            if wanted != poll {
                poll = wanted;
                tick = new_interval(poll);
            }
        }
        tracing::debug!("Controller loop for {} exited", self.session_id);
    }

    async fn handle(&mut self, message: ControllerMessage) {
        match message {
            ControllerMessage::Hook(hook) => self.on_hook(hook).await,
            ControllerMessage::AiResult { generation, result } => {
                self.on_ai_result(generation, result).await
            }
            ControllerMessage::TimerFired(fired) => self.on_timer(fired).await,
            ControllerMessage::Control(command) => self.on_control(command).await,
        }
    }

    // ---------- 检测 ----------

    async fn read_output(&mut self) -> Option<String> {
        match self.session.read_recent_output(&self.session_id).await {
            Ok(output) => {
                self.last_output = output.clone();
                Some(output)
            }
            Err(e) => {
                self.on_session_error(e).await;
                None
            }
        }
    }

    async fn evaluate(&mut self) -> Option<DetectionSnapshot> {
        let output = self.read_output().await?;
        let snapshot = self
            .detection
            .evaluate(&output, self.config.idle_timeout(), Instant::now());
        self.record_detection(snapshot.clone()).await;
        Some(snapshot)
    }

    async fn record_detection(&mut self, snapshot: DetectionSnapshot) {
        if snapshot != self.last_detection {
            self.last_detection = snapshot.clone();
            self.events.emit(RespawnEvent::DetectionUpdate {
                session_id: self.session_id.clone(),
                detection: snapshot,
            });
            self.publish().await;
        }
    }

    async fn on_tick(&mut self) {
        match self.state {
            RespawnState::Watching | RespawnState::ConfirmingIdle => {
                if let Some(snapshot) = self.evaluate().await {
                    self.route_detection(snapshot).await;
                }
            }
            RespawnState::MonitoringInit => {
                if let Some(snapshot) = self.evaluate().await {
                    if self.detection.classify(&snapshot) == Verdict::Idle {
                        self.cancel_timer(TIMER_INIT_MONITOR);
                        self.send_step(Step::Update).await;
                    }
                }
            }
            state if state.is_waiting() => self.check_step_completion().await,
            // ai_checking 期间不接受新的检测输入
            _ => {}
        }
    }

    /// watching / confirming_idle 下对一次评估结果做路由
    async fn route_detection(&mut self, snapshot: DetectionSnapshot) {
        let verdict = self.detection.classify(&snapshot);
        match (self.state, verdict) {
            (RespawnState::Watching, Verdict::Working) => {}
            (RespawnState::Watching, _) => {
                self.transition(RespawnState::ConfirmingIdle).await;
                if snapshot.is_hook_confirmed() {
                    self.begin_cycle().await;
                } else {
                    self.arm_idle_confirm();
                }
            }
            (RespawnState::ConfirmingIdle, Verdict::Working) => {
                self.cancel_timer(TIMER_IDLE_CONFIRM);
                self.transition(RespawnState::Watching).await;
            }
            (RespawnState::ConfirmingIdle, Verdict::Idle) if snapshot.is_hook_confirmed() => {
                self.begin_cycle().await;
            }
            _ => {}
        }
    }

    fn arm_idle_confirm(&mut self) {
        self.start_timer(
            TIMER_IDLE_CONFIRM,
            Duration::from_millis(self.policy.confirm_window_ms),
            "confirming idle",
        );
    }

    /// 确认窗口结束：再评估一次决定去向
    async fn on_confirm_window(&mut self) {
        let Some(snapshot) = self.evaluate().await else {
            return;
        };
        if self.state != RespawnState::ConfirmingIdle {
            return;
        }
        match self.detection.classify(&snapshot) {
            Verdict::Idle => self.begin_cycle().await,
            Verdict::Working => self.transition(RespawnState::Watching).await,
            Verdict::Ambiguous => {
                if self.detection.should_ai_check(&snapshot, Instant::now()) {
                    self.start_ai_check().await;
                } else {
                    self.arm_idle_confirm();
                }
            }
        }
    }

    async fn start_ai_check(&mut self) {
        let Some(checker) = self.checker.clone() else {
            self.arm_idle_confirm();
            return;
        };
        let generation = self.detection.begin_ai_check();
        self.transition(RespawnState::AiChecking).await;
        self.events.emit(RespawnEvent::AiCheckStarted {
            session_id: self.session_id.clone(),
        });

        let transcript = self.last_output.clone();
        let timeout = Duration::from_millis(self.policy.ai_check_timeout_ms);
        let inbox = self.inbox.clone();
        self.ai_task = Some(tokio::spawn(async move {
            let result = run_ai_check(checker, transcript, timeout).await;
            if let Some(tx) = inbox.upgrade() {
                let _ = tx.send(ControllerMessage::AiResult { generation, result });
            }
        }));
        tracing::debug!("AI check #{} started for {}", generation, self.session_id);
    }

    fn abort_ai_check(&mut self) {
        if self.detection.invalidate_ai_check() {
            tracing::debug!("In-flight AI check for {} invalidated", self.session_id);
        }
        if let Some(task) = self.ai_task.take() {
            task.abort();
        }
    }

    async fn on_ai_result(&mut self, generation: u64, result: Result<AiVerdict, String>) {
        let Some(outcome) = self
            .detection
            .complete_ai_check(generation, result, Instant::now())
        else {
            tracing::debug!(
                "Discarding stale AI result #{} for {}",
                generation,
                self.session_id
            );
            return;
        };
        self.ai_task = None;

        match outcome {
            AiOutcome::Verdict {
                verdict,
                cooldown,
                snapshot,
            } => {
                tracing::info!("AI check for {}: {}", self.session_id, verdict.as_str());
                self.events.emit(RespawnEvent::AiCheckCompleted {
                    session_id: self.session_id.clone(),
                    verdict,
                });
                self.log_action(
                    ActionLogEntry::new(ActionKind::AiCheck, "idle confirmation")
                        .with_verdict(verdict.as_str()),
                )
                .await;
                self.start_ai_cooldown(cooldown, "ai-cooldown");
                self.record_detection(snapshot).await;

                if self.state != RespawnState::AiChecking {
                    return;
                }
                match verdict {
                    AiVerdict::Idle => self.begin_cycle().await,
                    AiVerdict::Working => {
                        self.transition(RespawnState::ConfirmingIdle).await;
                        self.arm_idle_confirm();
                    }
                }
            }
            AiOutcome::Failed {
                error,
                backoff,
                snapshot,
            } => {
                tracing::warn!(
                    "AI check for {} failed, falling back to heuristics: {}",
                    self.session_id,
                    error
                );
                self.events.emit(RespawnEvent::AiCheckFailed {
                    session_id: self.session_id.clone(),
                    error: error.clone(),
                });
                self.log_action(
                    ActionLogEntry::new(ActionKind::AiCheck, error).with_verdict("ERROR"),
                )
                .await;
                self.start_ai_cooldown(backoff, "ai-cooldown (failure backoff)");
                self.record_detection(snapshot).await;

                if self.state == RespawnState::AiChecking {
                    self.transition(RespawnState::ConfirmingIdle).await;
                    self.arm_idle_confirm();
                }
            }
        }
    }

    fn start_ai_cooldown(&mut self, cooldown: Duration, reason: &str) {
        self.start_timer(TIMER_AI_COOLDOWN, cooldown, reason);
        self.events.emit(RespawnEvent::AiCheckCooldown {
            session_id: self.session_id.clone(),
            cooldown_ms: cooldown.as_millis() as u64,
        });
    }

    // ---------- hook ----------

    async fn on_hook(&mut self, hook: HookEvent) {
        self.log_action(ActionLogEntry::new(ActionKind::Hook, hook.as_str()))
            .await;
        if self.state == RespawnState::Stopped {
            return;
        }

        match hook {
            HookEvent::IdlePrompt | HookEvent::Stop => {
                self.elicitation_pending = false;
                self.detection.record_hook(hook);
                match self.state {
                    RespawnState::AiChecking => {
                        // hook 优先于进行中的 AI 确认，其结果到达后会被丢弃
                        self.abort_ai_check();
                        self.transition(RespawnState::ConfirmingIdle).await;
                        if let Some(snapshot) = self.evaluate().await {
                            self.route_detection(snapshot).await;
                        }
                    }
                    RespawnState::Watching | RespawnState::ConfirmingIdle => {
                        if let Some(snapshot) = self.evaluate().await {
                            self.route_detection(snapshot).await;
                        }
                    }
                    RespawnState::MonitoringInit => self.on_tick().await,
                    // 其余状态：留待下一次评估消费
                    _ => {}
                }
            }
            HookEvent::ElicitationDialog => {
                self.elicitation_pending = true;
            }
            HookEvent::PermissionPrompt => self.auto_accept().await,
        }
    }

    async fn auto_accept(&mut self) {
        if !self.config.auto_accept_prompts {
            return;
        }
        if self.elicitation_pending {
            self.log_action(
                ActionLogEntry::new(ActionKind::PlanCheck, "permission prompt")
                    .with_verdict("skipped: elicitation pending"),
            )
            .await;
            return;
        }
        if !matches!(
            self.state,
            RespawnState::Watching | RespawnState::ConfirmingIdle
        ) {
            return;
        }

        if let Err(e) = self
            .session
            .send_input(&self.session_id, AUTO_ACCEPT_INPUT)
            .await
        {
            self.on_session_error(e).await;
            return;
        }
        tracing::info!("Auto-accepted permission prompt for {}", self.session_id);
        self.events.emit(RespawnEvent::AutoAcceptSent {
            session_id: self.session_id.clone(),
        });
        self.log_action(
            ActionLogEntry::new(ActionKind::PlanCheck, "permission prompt").with_verdict("accepted"),
        )
        .await;
    }

    // ---------- 周期 ----------

    /// 空闲已确认：选择本周期的第一步
    fn first_step(&self) -> Step {
        if self.cycle_count == 0 && self.config.kickstart().is_some() {
            Step::Kickstart
        } else if self.config.send_clear {
            Step::Clear
        } else if self.config.send_init {
            Step::Init
        } else {
            Step::Update
        }
    }

    async fn begin_cycle(&mut self) {
        self.cancel_timer(TIMER_IDLE_CONFIRM);
        self.elicitation_pending = false;
        let step = self.first_step();
        self.events.emit(RespawnEvent::CycleStarted {
            session_id: self.session_id.clone(),
            cycle_number: self.cycle_count + 1,
        });
        self.send_step(step).await;
    }

    fn step_input(&self, step: Step) -> String {
        match step {
            Step::Update => self.config.update_prompt.clone(),
            Step::Clear => CLEAR_COMMAND.to_string(),
            Step::Init => INIT_COMMAND.to_string(),
            Step::Kickstart => self
                .config
                .kickstart()
                .unwrap_or(&self.config.update_prompt)
                .to_string(),
        }
    }

    /// 进入 sending_* 发送一次输入，然后进入 waiting_*
    async fn send_step(&mut self, step: Step) {
        self.transition(step.sending_state()).await;

        let Some(before) = self.read_output().await else {
            return;
        };
        let input = self.step_input(step);
        self.baseline = Some((progress_fingerprint(&before, &input), input.clone()));

        if let Err(e) = self.session.send_input(&self.session_id, &input).await {
            self.on_session_error(e).await;
            return;
        }
        tracing::info!("Sent {} step to {}", step.as_str(), self.session_id);
        self.events.emit(RespawnEvent::StepSent {
            session_id: self.session_id.clone(),
            step,
            input: input.clone(),
        });
        self.log_action(ActionLogEntry::new(
            ActionKind::Command,
            format!("{}: {}", step.as_str(), input),
        ))
        .await;

        if step.completes_cycle() {
            self.cycle_count += 1;
        }
        self.current_step = Some(step);
        self.step_delay_elapsed = false;
        self.transition(step.waiting_state()).await;
        self.start_timer(TIMER_STEP_DELAY, self.config.inter_step_delay(), "inter-step delay");
        self.start_timer(
            TIMER_STEP_TIMEOUT,
            self.policy.wait_timeout(&self.config),
            "step timeout",
        );
    }

    /// waiting_*：步间延迟结束且智能体输出相对发送前有变化，即视为完成；输入回显不算
    async fn check_step_completion(&mut self) {
        if self.state == RespawnState::MonitoringInit || !self.step_delay_elapsed {
            return;
        }
        let Some(output) = self.read_output().await else {
            return;
        };
        let progressed = match &self.baseline {
            Some((before, sent)) => *before != progress_fingerprint(&output, sent),
            None => false,
        };
        if progressed {
            self.complete_step(true).await;
        }
    }

    async fn complete_step(&mut self, progress: bool) {
        self.cancel_timer(TIMER_STEP_DELAY);
        self.cancel_timer(TIMER_STEP_TIMEOUT);
        self.baseline = None;
        let Some(step) = self.current_step.take() else {
            return;
        };
        tracing::debug!(
            "Step {} for {} completed (progress: {})",
            step.as_str(),
            self.session_id,
            progress
        );

        match step {
            Step::Clear => {
                let next = if self.config.send_init {
                    Step::Init
                } else {
                    Step::Update
                };
                self.send_step(next).await;
            }
            Step::Init => {
                self.detection.start_new_cycle();
                self.transition(RespawnState::MonitoringInit).await;
                self.start_timer(
                    TIMER_INIT_MONITOR,
                    Duration::from_millis(self.policy.init_monitor_ms),
                    "waiting for init",
                );
            }
            Step::Update | Step::Kickstart => self.finish_cycle(progress).await,
        }
    }

    async fn finish_cycle(&mut self, progress: bool) {
        let (transition, breaker) = {
            let mut breaker = self.breaker.lock().await;
            (breaker.record_cycle(progress), breaker.snapshot())
        };

        if transition != BreakerTransition::Unchanged {
            self.events.emit(RespawnEvent::CircuitBreakerUpdate {
                session_id: self.session_id.clone(),
                state: breaker.state,
                reason: breaker.reason.clone(),
            });
        }
        match transition {
            BreakerTransition::Stuck => {
                tracing::warn!(
                    "Session {} looks stuck: {}",
                    self.session_id,
                    breaker.reason.as_deref().unwrap_or_default()
                );
            }
            BreakerTransition::Recovered => {
                tracing::info!("Session {} made progress again", self.session_id);
            }
            BreakerTransition::Tripped => {
                let details = breaker.reason.unwrap_or_default();
                self.block(BlockReason::CircuitBreakerOpen, details).await;
                return;
            }
            BreakerTransition::Unchanged => {}
        }

        if let Some(config) = self.pending_config.take() {
            tracing::info!("Applying updated config for {}", self.session_id);
            self.config = config;
        }
        self.detection.start_new_cycle();
        self.transition(RespawnState::Watching).await;
    }

    // ---------- 定时器 ----------

    fn start_timer(&mut self, name: &str, duration: Duration, reason: &str) -> Timer {
        let (timer, replaced) = self.timers.start(name, duration, reason);
        if let Some(old) = replaced {
            self.events.emit(RespawnEvent::TimerCancelled {
                session_id: self.session_id.clone(),
                timer: old,
            });
        }
        self.events.emit(RespawnEvent::TimerStarted {
            session_id: self.session_id.clone(),
            timer: timer.clone(),
        });
        timer
    }

    fn cancel_timer(&mut self, name: &str) {
        if let Some(timer) = self.timers.cancel(name) {
            self.events.emit(RespawnEvent::TimerCancelled {
                session_id: self.session_id.clone(),
                timer,
            });
        }
    }

    async fn on_timer(&mut self, fired: TimerFired) {
        let Some(timer) = self.timers.complete(&fired) else {
            return;
        };
        self.events.emit(RespawnEvent::TimerCompleted {
            session_id: self.session_id.clone(),
            timer,
        });

        match fired.name.as_str() {
            TIMER_RUN_DURATION => {
                tracing::info!("Timed run for {} elapsed", self.session_id);
                self.halt(StopReason::DurationElapsed).await;
            }
            TIMER_IDLE_CONFIRM if self.state == RespawnState::ConfirmingIdle => {
                self.on_confirm_window().await;
            }
            TIMER_STEP_DELAY => {
                self.step_delay_elapsed = true;
                self.check_step_completion().await;
            }
            TIMER_STEP_TIMEOUT if self.state.is_waiting() => {
                tracing::warn!(
                    "Session {} did not respond in {}, treating as no progress",
                    self.session_id,
                    self.state
                );
                self.complete_step(false).await;
            }
            TIMER_INIT_MONITOR if self.state == RespawnState::MonitoringInit => {
                self.send_step(Step::Update).await;
            }
            TIMER_AI_COOLDOWN => self.detection.end_cooldown(),
            _ => {}
        }
        self.publish().await;
    }

    // ---------- 控制 ----------

    async fn on_control(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::Stop(reason) => self.halt(reason).await,
            ControlCommand::UpdateConfig(config) => {
                if self.state == RespawnState::Watching {
                    self.config = config;
                    tracing::info!("Config for {} updated", self.session_id);
                } else {
                    self.pending_config = Some(config);
                    tracing::info!(
                        "Config for {} will apply at the next cycle boundary",
                        self.session_id
                    );
                }
            }
            ControlCommand::SessionExited(details) => {
                self.block(BlockReason::ExitSignal, details).await
            }
            ControlCommand::ReportBlocked(details) => {
                self.block(BlockReason::StatusBlocked, details).await
            }
        }
    }

    async fn on_session_error(&mut self, error: SessionError) {
        self.events.emit(RespawnEvent::Error {
            session_id: self.session_id.clone(),
            error: error.to_string(),
        });
        match error {
            SessionError::Io(ref message) if !self.state.is_sending() => {
                // 读取失败：下一个节拍重试
                tracing::warn!("Reading session {} failed: {}", self.session_id, message);
            }
            other => {
                // 发送失败后输入流状态未知，不再自动继续
                self.block(BlockReason::ExitSignal, other.to_string()).await;
            }
        }
    }

    async fn block(&mut self, reason: BlockReason, details: String) {
        if self.state == RespawnState::Stopped {
            return;
        }
        tracing::warn!("Respawn blocked for {}: {:?} ({})", self.session_id, reason, details);
        self.events.emit(RespawnEvent::Blocked {
            session_id: self.session_id.clone(),
            reason,
            details,
        });
        self.halt(reason.into()).await;
    }

    /// 任意状态 → stopped：取消全部定时器，作废进行中的 AI 确认
    async fn halt(&mut self, reason: StopReason) {
        if self.state == RespawnState::Stopped {
            return;
        }
        for timer in self.timers.cancel_all() {
            self.events.emit(RespawnEvent::TimerCancelled {
                session_id: self.session_id.clone(),
                timer,
            });
        }
        self.abort_ai_check();
        self.current_step = None;
        self.stop_reason = Some(reason);
        self.transition(RespawnState::Stopped).await;
        self.events.emit(RespawnEvent::Stopped {
            session_id: self.session_id.clone(),
            reason,
        });
        tracing::info!(
            "Respawn stopped for {} after {} cycles ({:?})",
            self.session_id,
            self.cycle_count,
            reason
        );
    }

    // ---------- 状态发布 ----------

    async fn transition(&mut self, state: RespawnState) {
        if self.state == state {
            return;
        }
        tracing::debug!("{}: {} -> {}", self.session_id, self.state, state);
        self.state = state;
        self.events.emit(RespawnEvent::StateChanged {
            session_id: self.session_id.clone(),
            state,
        });
        self.publish().await;
    }

    async fn current_status(&self) -> ControllerStatus {
        ControllerStatus {
            session_id: self.session_id.clone(),
            state: self.state,
            cycle_count: self.cycle_count,
            started_at: self.started_at,
            circuit_breaker: self.breaker.lock().await.snapshot(),
            detection: self.last_detection.clone(),
            timers: self.timers.active(),
            run_ends_at: self.run_ends_at,
            stop_reason: self.stop_reason,
        }
    }

    async fn publish(&self) {
        let status = self.current_status().await;
        self.status_tx.send_replace(status);
    }

    async fn log_action(&self, entry: ActionLogEntry) {
        if self.action_log.append(&self.session_id, entry.clone()).await {
            self.events.emit(RespawnEvent::ActionLog {
                session_id: self.session_id.clone(),
                action: entry,
            });
        }
    }
}

fn new_interval(period: Duration) -> tokio::time::Interval {
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tick
}
