//! 进程退出
//!
//! Ctrl+C、SIGTERM、stdin 的 exit 命令都汇到同一个 ShutdownSignal；
//! 退出前所有控制器以 shutdown 原因停止（定时器取消、进行中的 AI 确认作废）。

use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::respawn::{RespawnManager, StopReason};

/// 停止控制器的默认等待上限
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    Interrupted,
    /// SIGTERM
    Terminated,
    /// exit 命令或 stdin 关闭
    InputClosed,
}

/// 可克隆的关闭信号；只记录第一次触发的原因
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<ShutdownReason>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self, reason: ShutdownReason) {
        if self.reason.set(reason).is_ok() {
            tracing::info!("Shutdown requested ({:?})", reason);
        }
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.get().copied()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub async fn triggered(&self) {
        self.token.cancelled().await;
    }

    /// 监听 Ctrl+C 与 SIGTERM
    pub fn install_os_handlers(&self) {
        let signal = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                signal.trigger(ShutdownReason::Interrupted);
            }
        });

        #[cfg(unix)]
        {
            let signal = self.clone();
            tokio::spawn(async move {
                use tokio::signal::unix::{signal as unix_signal, SignalKind};
                match unix_signal(SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                        signal.trigger(ShutdownReason::Terminated);
                    }
                    Err(e) => tracing::warn!("Cannot listen for SIGTERM: {}", e),
                }
            });
        }
    }
}

/// 停掉所有控制器；超时后放弃等待，返回已停止数量
pub async fn drain_controllers(manager: &RespawnManager, timeout: Duration) -> usize {
    match tokio::time::timeout(timeout, manager.stop_all(StopReason::Shutdown)).await {
        Ok(stopped) => {
            tracing::info!("Stopped {} respawn controllers", stopped);
            stopped
        }
        Err(_) => {
            tracing::warn!("Stopping controllers timed out after {:?}", timeout);
            0
        }
    }
}

/// 运行 app 直到它结束或收到关闭信号，然后停掉所有控制器
pub async fn run_until_shutdown<Fut>(
    signal: ShutdownSignal,
    app: Fut,
    manager: Arc<RespawnManager>,
    drain_timeout: Duration,
) -> ShutdownReason
where
    Fut: Future<Output = ()>,
{
    tokio::select! {
        _ = app => signal.trigger(ShutdownReason::InputClosed),
        _ = signal.triggered() => {}
    }
    drain_controllers(&manager, drain_timeout).await;
    signal.reason().unwrap_or(ShutdownReason::InputClosed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::respawn::{AutomationConfig, ConfigStore, PresetLibrary, RespawnPolicy};
    use crate::session::MockSession;

    fn manager() -> Arc<RespawnManager> {
        Arc::new(RespawnManager::new(
            Arc::new(MockSession::new("working")),
            None,
            RespawnPolicy::default(),
            ConfigStore::new(PresetLibrary::new()),
        ))
    }

    #[test]
    fn test_first_reason_wins() {
        let signal = ShutdownSignal::new();
        let token = signal.token();
        assert!(!signal.is_triggered());

        signal.clone().trigger(ShutdownReason::Terminated);
        signal.trigger(ShutdownReason::Interrupted);
        assert!(token.is_cancelled());
        assert_eq!(signal.reason(), Some(ShutdownReason::Terminated));
    }

    #[tokio::test(start_paused = true)]
    async fn test_app_exit_stops_controllers() {
        let manager = manager();
        manager
            .enable("s1", AutomationConfig::default(), None)
            .await
            .unwrap();
        manager
            .enable("s2", AutomationConfig::default(), None)
            .await
            .unwrap();

        let reason = run_until_shutdown(
            ShutdownSignal::new(),
            async {},
            Arc::clone(&manager),
            DEFAULT_DRAIN_TIMEOUT,
        )
        .await;
        assert_eq!(reason, ShutdownReason::InputClosed);
        assert!(manager.status("s1").await.is_none());
        assert!(manager.active_sessions().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_signal_interrupts_running_app() {
        let manager = manager();
        manager
            .enable("s1", AutomationConfig::default(), None)
            .await
            .unwrap();

        let signal = ShutdownSignal::new();
        let trigger = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            trigger.trigger(ShutdownReason::Interrupted);
        });

        let reason = run_until_shutdown(
            signal,
            std::future::pending(),
            Arc::clone(&manager),
            DEFAULT_DRAIN_TIMEOUT,
        )
        .await;
        assert_eq!(reason, ShutdownReason::Interrupted);
        assert!(manager.active_sessions().await.is_empty());
    }
}
