//! 自动续跑端到端场景测试（经由 RespawnManager，虚拟时间）

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::broadcast;
    use tokio::time::Instant;

    use respawn::core::{RespawnError, SessionError};
    use respawn::respawn::{
        ActionKind, AiCheckStatus, AiChecker, AiVerdict, AutomationConfig, BlockReason,
        CircuitState, ConfigStore, HeuristicScore, IdleHeuristic, PresetLibrary, RespawnEvent,
        RespawnManager, RespawnPolicy, RespawnState, Step, StopReason,
    };
    use respawn::session::{HookEvent, MockSession, SessionIo};

    const SESSION: &str = "work:0.1";

    /// 固定置信度的启发式
    struct Fixed(u8);

    impl IdleHeuristic for Fixed {
        fn score(&mut self, _: &str, _: Duration, _: Instant) -> HeuristicScore {
            HeuristicScore {
                confidence: self.0,
                status_text: Some(format!("fixed {}", self.0)),
            }
        }
    }

    /// 延迟后返回预设结果的 AI 确认
    struct ScriptedChecker {
        reply: Result<AiVerdict, String>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl ScriptedChecker {
        fn new(reply: Result<AiVerdict, String>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                reply,
                delay,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl AiChecker for ScriptedChecker {
        async fn check(&self, _transcript: &str) -> Result<AiVerdict, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.reply.clone()
        }
    }

    /// 记录并发发送数的会话
    #[derive(Default)]
    struct SerialCheckingSession {
        inner: MockSession,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    #[async_trait]
    impl SessionIo for SerialCheckingSession {
        async fn read_recent_output(&self, session_id: &str) -> Result<String, SessionError> {
            self.inner.read_recent_output(session_id).await
        }

        async fn send_input(&self, session_id: &str, text: &str) -> Result<(), SessionError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(200)).await;
            let result = self.inner.send_input(session_id, text).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    fn config() -> AutomationConfig {
        AutomationConfig {
            update_prompt: "continue".to_string(),
            idle_timeout_ms: 1_000,
            inter_step_delay_ms: 500,
            ..AutomationConfig::default()
        }
    }

    fn manager(
        session: Arc<dyn SessionIo>,
        checker: Option<Arc<dyn AiChecker>>,
        confidence: u8,
    ) -> RespawnManager {
        RespawnManager::new(
            session,
            checker,
            RespawnPolicy::default(),
            ConfigStore::new(PresetLibrary::new()),
        )
        .with_heuristic(Arc::new(move || {
            Box::new(Fixed(confidence)) as Box<dyn IdleHeuristic>
        }))
    }

    /// 收集事件直到 pred 命中（含命中的那个）
    async fn collect_until(
        rx: &mut broadcast::Receiver<RespawnEvent>,
        pred: impl Fn(&RespawnEvent) -> bool,
    ) -> Vec<RespawnEvent> {
        tokio::time::timeout(Duration::from_secs(3_600), async {
            let mut seen = Vec::new();
            loop {
                let event = rx.recv().await.expect("event stream closed");
                let done = pred(&event);
                seen.push(event);
                if done {
                    return seen;
                }
            }
        })
        .await
        .expect("expected event never arrived")
    }

    fn is_state(state: RespawnState) -> impl Fn(&RespawnEvent) -> bool {
        move |e| matches!(e, RespawnEvent::StateChanged { state: s, .. } if *s == state)
    }

    fn is_named(name: &'static str) -> impl Fn(&RespawnEvent) -> bool {
        move |e| e.name() == name
    }

    fn drain(rx: &mut broadcast::Receiver<RespawnEvent>) -> Vec<RespawnEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn steps(events: &[RespawnEvent]) -> Vec<Step> {
        events
            .iter()
            .filter_map(|e| match e {
                RespawnEvent::StepSent { step, .. } => Some(*step),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_idle_routes_to_kickstart_then_update() {
        let session = Arc::new(MockSession::new("❯ ").with_echo());
        let mgr = manager(session.clone(), None, 0);
        let mut rx = mgr.subscribe();

        let cfg = AutomationConfig {
            kickstart_prompt: Some("start".to_string()),
            send_clear: false,
            ..config()
        };
        mgr.enable(SESSION, cfg, None).await.unwrap();
        collect_until(&mut rx, is_named("respawn:started")).await;

        mgr.deliver_hook(SESSION, HookEvent::IdlePrompt).await.unwrap();
        let first = collect_until(&mut rx, is_state(RespawnState::Watching)).await;
        assert_eq!(steps(&first), vec![Step::Kickstart]);
        assert!(first
            .iter()
            .any(|e| matches!(e, RespawnEvent::StateChanged { state: RespawnState::SendingKickstart, .. })));
        assert!(!first
            .iter()
            .any(|e| matches!(e, RespawnEvent::StateChanged { state: RespawnState::SendingUpdate, .. })));

        mgr.deliver_hook(SESSION, HookEvent::Stop).await.unwrap();
        let second = collect_until(&mut rx, is_state(RespawnState::Watching)).await;
        assert_eq!(steps(&second), vec![Step::Update]);
        assert_eq!(session.sent(), vec!["start".to_string(), "continue".to_string()]);
        assert_eq!(mgr.status(SESSION).await.unwrap().cycle_count, 2);

        mgr.stop(SESSION).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_progress_cycles_trip_breaker_once() {
        // 终端只回显输入，智能体没有任何回复：每个周期都以超时结束
        let session = Arc::new(MockSession::new("❯ ").with_echo());
        let mgr = manager(session.clone(), None, 0);
        let mut rx = mgr.subscribe();
        mgr.enable(SESSION, config(), None).await.unwrap();
        collect_until(&mut rx, is_named("respawn:started")).await;

        let mut all = Vec::new();
        for _ in 0..2 {
            mgr.deliver_hook(SESSION, HookEvent::Stop).await.unwrap();
            all.extend(collect_until(&mut rx, is_state(RespawnState::Watching)).await);
        }
        assert_eq!(mgr.circuit_breaker(SESSION).await.state, CircuitState::HalfOpen);
        assert!(all.iter().any(|e| matches!(
            e,
            RespawnEvent::CircuitBreakerUpdate { state: CircuitState::HalfOpen, .. }
        )));

        mgr.deliver_hook(SESSION, HookEvent::Stop).await.unwrap();
        all.extend(collect_until(&mut rx, is_named("respawn:stopped")).await);
        tokio::time::sleep(Duration::from_secs(5)).await;
        all.extend(drain(&mut rx));

        let blocked: Vec<_> = all
            .iter()
            .filter_map(|e| match e {
                RespawnEvent::Blocked { reason, .. } => Some(*reason),
                _ => None,
            })
            .collect();
        assert_eq!(blocked, vec![BlockReason::CircuitBreakerOpen]);

        let status = mgr.status(SESSION).await.unwrap();
        assert_eq!(status.state, RespawnState::Stopped);
        assert_eq!(status.stop_reason, Some(StopReason::CircuitBreakerOpen));
        assert_eq!(status.circuit_breaker.state, CircuitState::Open);
        assert_eq!(session.sent().len(), 3);

        // 停止后的 hook 不会再触发任何周期
        assert!(matches!(
            mgr.deliver_hook(SESSION, HookEvent::Stop).await,
            Err(RespawnError::NotEnabled(_))
        ));
        assert!(matches!(
            mgr.enable(SESSION, config(), None).await,
            Err(RespawnError::CircuitOpen(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_agent_reply_keeps_breaker_closed() {
        let session = Arc::new(
            MockSession::new("❯ ")
                .with_echo()
                .with_reply("Working on the next item"),
        );
        let mgr = manager(session.clone(), None, 0);
        let mut rx = mgr.subscribe();
        mgr.enable(SESSION, config(), None).await.unwrap();
        collect_until(&mut rx, is_named("respawn:started")).await;

        let mut all = Vec::new();
        for _ in 0..4 {
            mgr.deliver_hook(SESSION, HookEvent::Stop).await.unwrap();
            all.extend(collect_until(&mut rx, is_state(RespawnState::Watching)).await);
        }

        let status = mgr.status(SESSION).await.unwrap();
        assert_eq!(status.state, RespawnState::Watching);
        assert_eq!(status.cycle_count, 4);
        assert_eq!(status.circuit_breaker.state, CircuitState::Closed);
        assert!(!all.iter().any(|e| matches!(e, RespawnEvent::Blocked { .. })));

        mgr.stop(SESSION).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_closes_breaker_without_restarting() {
        let session = Arc::new(MockSession::new("❯ "));
        let mgr = manager(session.clone(), None, 0);
        let mut rx = mgr.subscribe();
        mgr.enable(SESSION, config(), None).await.unwrap();
        collect_until(&mut rx, is_named("respawn:started")).await;

        for _ in 0..2 {
            mgr.deliver_hook(SESSION, HookEvent::Stop).await.unwrap();
            collect_until(&mut rx, is_state(RespawnState::Watching)).await;
        }
        mgr.deliver_hook(SESSION, HookEvent::Stop).await.unwrap();
        collect_until(&mut rx, is_named("respawn:stopped")).await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        let breaker = mgr.reset_circuit_breaker(SESSION).await;
        assert_eq!(breaker.state, CircuitState::Closed);
        assert_eq!(breaker.consecutive_no_progress, 0);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(
            mgr.status(SESSION).await.unwrap().state,
            RespawnState::Stopped
        );
        assert!(mgr.active_sessions().await.is_empty());
        assert_eq!(session.sent().len(), 3);

        let status = mgr.enable(SESSION, config(), None).await.unwrap();
        assert_eq!(status.state, RespawnState::Watching);
        assert_eq!(status.circuit_breaker.state, CircuitState::Closed);
        mgr.stop(SESSION).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_duration_timer_forces_stop() {
        let session = Arc::new(MockSession::new("✻ Working…"));
        let mgr = manager(session.clone(), None, 10);
        let mut rx = mgr.subscribe();

        let started = Instant::now();
        let status = mgr.enable(SESSION, config(), Some(1)).await.unwrap();
        assert!(status.run_ends_at.is_some());
        assert!(status.timers.iter().any(|t| t.name == "run-duration"));

        let events = collect_until(&mut rx, is_named("respawn:stopped")).await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(60));
        assert!(elapsed <= Duration::from_secs(61));

        let completed = events
            .iter()
            .filter(|e| matches!(e, RespawnEvent::TimerCompleted { timer, .. } if timer.name == "run-duration"))
            .count();
        assert_eq!(completed, 1);
        match events.last() {
            Some(RespawnEvent::Stopped { reason, .. }) => {
                assert_eq!(*reason, StopReason::DurationElapsed)
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(session.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duration_timer_stops_mid_cycle() {
        // 没有回显，等待步骤一直到超时；运行时长在等待中到期
        let session = Arc::new(MockSession::new("❯ "));
        let mgr = manager(session.clone(), None, 0);
        let mut rx = mgr.subscribe();
        let cfg = AutomationConfig {
            inter_step_delay_ms: 600_000,
            ..config()
        };
        mgr.enable(SESSION, cfg, Some(1)).await.unwrap();
        mgr.deliver_hook(SESSION, HookEvent::Stop).await.unwrap();
        collect_until(&mut rx, is_state(RespawnState::WaitingUpdate)).await;

        let events = collect_until(&mut rx, is_named("respawn:stopped")).await;
        assert!(matches!(
            events.last(),
            Some(RespawnEvent::Stopped { reason: StopReason::DurationElapsed, .. })
        ));
        let status = mgr.status(SESSION).await.unwrap();
        assert!(status.timers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hook_overrides_in_flight_ai_check() {
        let session = Arc::new(MockSession::new("❯ ").with_echo());
        let checker = ScriptedChecker::new(Ok(AiVerdict::Working), Duration::from_secs(60));
        let mgr = manager(session.clone(), Some(checker.clone() as Arc<dyn AiChecker>), 50);
        let mut rx = mgr.subscribe();
        mgr.enable(SESSION, config(), None).await.unwrap();

        let before = collect_until(&mut rx, is_named("respawn:aiCheckStarted")).await;
        assert!(before
            .iter()
            .any(|e| matches!(e, RespawnEvent::StateChanged { state: RespawnState::ConfirmingIdle, .. })));
        assert_eq!(
            mgr.status(SESSION).await.unwrap().state,
            RespawnState::AiChecking
        );

        mgr.deliver_hook(SESSION, HookEvent::Stop).await.unwrap();
        let after = collect_until(&mut rx, is_named("respawn:stepSent")).await;
        assert_eq!(steps(&after), vec![Step::Update]);
        let hook_update = after.iter().find_map(|e| match e {
            RespawnEvent::DetectionUpdate { detection, .. } if detection.is_hook_confirmed() => {
                Some(detection.confidence_level)
            }
            _ => None,
        });
        assert_eq!(hook_update, Some(100));

        let status = mgr.stop(SESSION).await.unwrap();
        tokio::time::sleep(Duration::from_secs(120)).await;
        let rest = drain(&mut rx);
        assert!(!after
            .iter()
            .chain(rest.iter())
            .any(|e| e.name() == "respawn:aiCheckCompleted"));
        assert_eq!(status.detection.ai_check.last_verdict, None);
        assert_eq!(checker.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ai_idle_verdict_starts_cycle() {
        let session = Arc::new(MockSession::new("❯ ").with_echo());
        let checker = ScriptedChecker::new(Ok(AiVerdict::Idle), Duration::from_secs(2));
        let mgr = manager(session.clone(), Some(checker as Arc<dyn AiChecker>), 50);
        let mut rx = mgr.subscribe();
        mgr.enable(SESSION, config(), None).await.unwrap();

        let events = collect_until(&mut rx, is_named("respawn:stepSent")).await;
        let completed = events.iter().position(|e| {
            matches!(e, RespawnEvent::AiCheckCompleted { verdict: AiVerdict::Idle, .. })
        });
        let cooldown = events
            .iter()
            .position(|e| e.name() == "respawn:aiCheckCooldown");
        assert!(completed.is_some());
        assert!(cooldown.is_some());
        assert_eq!(session.sent(), vec!["continue".to_string()]);

        let log = mgr.action_log(SESSION).await;
        assert!(log
            .iter()
            .any(|e| e.kind == ActionKind::AiCheck && e.verdict.as_deref() == Some("IDLE")));
        mgr.stop(SESSION).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ai_failure_degrades_to_heuristic() {
        let session = Arc::new(MockSession::new("❯ "));
        let checker = ScriptedChecker::new(Err("checker crashed".to_string()), Duration::from_secs(1));
        let mgr = manager(session.clone(), Some(checker as Arc<dyn AiChecker>), 50);
        let mut rx = mgr.subscribe();
        mgr.enable(SESSION, config(), None).await.unwrap();

        let events = collect_until(&mut rx, is_named("respawn:aiCheckFailed")).await;
        assert!(events.iter().any(|e| e.name() == "respawn:aiCheckStarted"));
        let degraded = collect_until(&mut rx, |e| {
            matches!(e, RespawnEvent::DetectionUpdate { detection, .. }
                if detection.ai_check.status == AiCheckStatus::Disabled)
        })
        .await;
        match degraded.last() {
            Some(RespawnEvent::DetectionUpdate { detection, .. }) => {
                assert_eq!(detection.confidence_level, 50);
            }
            other => panic!("unexpected {other:?}"),
        }

        tokio::time::sleep(Duration::from_secs(5)).await;
        let status = mgr.status(SESSION).await.unwrap();
        assert_ne!(status.state, RespawnState::Stopped);
        assert!(!drain(&mut rx).iter().any(|e| e.name() == "respawn:error"));
        assert!(session.sent().is_empty());
        mgr.stop(SESSION).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sends_never_overlap() {
        let session = Arc::new(SerialCheckingSession::default());
        session.inner.set_output("❯ ");
        let mgr = manager(session.clone(), None, 0);
        let mut rx = mgr.subscribe();
        let cfg = AutomationConfig {
            auto_accept_prompts: true,
            send_clear: true,
            ..config()
        };
        mgr.enable(SESSION, cfg, None).await.unwrap();

        mgr.deliver_hook(SESSION, HookEvent::Stop).await.unwrap();
        for _ in 0..3 {
            mgr.deliver_hook(SESSION, HookEvent::PermissionPrompt)
                .await
                .unwrap();
        }
        let events = collect_until(&mut rx, |e| {
            matches!(e, RespawnEvent::StepSent { step: Step::Update, .. })
        })
        .await;
        mgr.stop(SESSION).await.unwrap();

        assert_eq!(session.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(steps(&events), vec![Step::Clear, Step::Update]);
        // 等待中不会自动确认权限提示
        assert!(!events.iter().any(|e| e.name() == "respawn:autoAcceptSent"));

        // 每次发送之前都已离开上一个 waiting 状态
        let mut in_waiting = false;
        for event in &events {
            match event {
                RespawnEvent::StateChanged { state, .. } => in_waiting = state.is_waiting(),
                RespawnEvent::StepSent { .. } => assert!(!in_waiting),
                _ => {}
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_action_log_is_bounded_and_filtered() {
        let session = Arc::new(MockSession::new("✻ Working…"));
        let mgr = manager(session.clone(), None, 0);
        let cfg = AutomationConfig {
            auto_accept_prompts: true,
            ..config()
        };
        mgr.enable(SESSION, cfg, None).await.unwrap();

        for _ in 0..40 {
            mgr.deliver_hook(SESSION, HookEvent::PermissionPrompt)
                .await
                .unwrap();
        }
        mgr.stop(SESSION).await.unwrap();

        let log = mgr.action_log(SESSION).await;
        assert_eq!(log.len(), 30);
        assert!(log
            .iter()
            .all(|e| matches!(e.kind, ActionKind::Hook | ActionKind::PlanCheck)));
        assert!(log.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));
        assert_eq!(session.sent().len(), 40);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reported_block_stops_with_status_blocked() {
        let mgr = manager(Arc::new(MockSession::new("❯ ")), None, 0);
        let mut rx = mgr.subscribe();
        mgr.enable(SESSION, config(), None).await.unwrap();

        mgr.report_blocked(SESSION, "needs credentials").await.unwrap();
        let events = collect_until(&mut rx, is_named("respawn:stopped")).await;
        assert!(events.iter().any(|e| matches!(
            e,
            RespawnEvent::Blocked { reason: BlockReason::StatusBlocked, details, .. }
                if details == "needs credentials"
        )));
        assert!(matches!(
            events.last(),
            Some(RespawnEvent::Stopped { reason: StopReason::StatusBlocked, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_saved_preset_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("presets.toml");

        let original = AutomationConfig {
            update_prompt: "pick the next ticket".to_string(),
            send_clear: true,
            send_init: true,
            kickstart_prompt: Some("read TODO.md".to_string()),
            auto_accept_prompts: true,
            idle_timeout_ms: 12_000,
            inter_step_delay_ms: 1_500,
            duration_minutes: None,
            ..AutomationConfig::default()
        };

        let saved = {
            let mgr = RespawnManager::new(
                Arc::new(MockSession::new("")),
                None,
                RespawnPolicy::default(),
                ConfigStore::new(PresetLibrary::load(&path).unwrap()),
            );
            mgr.save_preset(&original, "ticket loop", None).await.unwrap()
        };

        let reloaded = RespawnManager::new(
            Arc::new(MockSession::new("")),
            None,
            RespawnPolicy::default(),
            ConfigStore::new(PresetLibrary::load(&path).unwrap()),
        );
        let applied = reloaded
            .apply_preset(SESSION, &saved.body.id)
            .await
            .unwrap();
        assert_eq!(applied, original);
        assert_eq!(reloaded.config(SESSION).await, Some(original));

        assert!(matches!(
            reloaded.delete_preset("builtin:solo-work").await,
            Err(RespawnError::PermissionDenied(_))
        ));
    }
}
