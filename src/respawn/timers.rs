//! 命名倒计时器
//!
//! 每个定时器在 tokio 中睡眠到期后调用注册的 on_expire 回调（控制器把它转成收件箱消息）。
//! 同名 start 会原子地替换旧定时器；到期消息携带代号，代号不匹配（已被替换或取消）的到期直接丢弃，
//! 因此每个逻辑定时器最多完成一次。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;

/// 对外可见的定时器信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Timer {
    pub name: String,
    pub ends_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub reason: String,
}

/// 到期通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerFired {
    pub session_id: String,
    pub name: String,
    pub generation: u64,
}

/// 到期回调
pub type ExpireCallback = Arc<dyn Fn(TimerFired) + Send + Sync>;

struct ActiveTimer {
    timer: Timer,
    generation: u64,
    handle: JoinHandle<()>,
}

/// 单会话的定时器管理
pub struct TimerManager {
    session_id: String,
    timers: HashMap<String, ActiveTimer>,
    next_generation: u64,
    on_expire: ExpireCallback,
}

impl std::fmt::Debug for TimerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerManager")
            .field("session_id", &self.session_id)
            .field("timers", &self.timers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TimerManager {
    pub fn new(session_id: impl Into<String>, on_expire: ExpireCallback) -> Self {
        Self {
            session_id: session_id.into(),
            timers: HashMap::new(),
            next_generation: 0,
            on_expire,
        }
    }

    /// 启动定时器；返回 (新定时器, 被替换的旧定时器)
    pub fn start(
        &mut self,
        name: &str,
        duration: Duration,
        reason: &str,
    ) -> (Timer, Option<Timer>) {
        let replaced = self.cancel(name);

        self.next_generation += 1;
        let generation = self.next_generation;
        let timer = Timer {
            name: name.to_string(),
            ends_at: Utc::now()
                + chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero()),
            duration_ms: duration.as_millis() as u64,
            reason: reason.to_string(),
        };

        let fired = TimerFired {
            session_id: self.session_id.clone(),
            name: name.to_string(),
            generation,
        };
        let on_expire = Arc::clone(&self.on_expire);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            on_expire(fired);
        });

        self.timers.insert(
            name.to_string(),
            ActiveTimer {
                timer: timer.clone(),
                generation,
                handle,
            },
        );
        (timer, replaced)
    }

    /// 取消定时器，返回被取消者
    pub fn cancel(&mut self, name: &str) -> Option<Timer> {
        self.timers.remove(name).map(|active| {
            active.handle.abort();
            active.timer
        })
    }

    /// 取消全部定时器
    pub fn cancel_all(&mut self) -> Vec<Timer> {
        let mut cancelled: Vec<Timer> = self
            .timers
            .drain()
            .map(|(_, active)| {
                active.handle.abort();
                active.timer
            })
            .collect();
        cancelled.sort_by(|a, b| a.name.cmp(&b.name));
        cancelled
    }

    /// 处理到期通知：仍是当前代号才算完成，返回完成的定时器
    pub fn complete(&mut self, fired: &TimerFired) -> Option<Timer> {
        let current = self.timers.get(&fired.name)?;
        if current.generation != fired.generation {
            return None;
        }
        self.timers.remove(&fired.name).map(|active| active.timer)
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.timers.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Timer> {
        self.timers.get(name).map(|active| &active.timer)
    }

    pub fn active(&self) -> Vec<Timer> {
        let mut timers: Vec<Timer> = self.timers.values().map(|a| a.timer.clone()).collect();
        timers.sort_by(|a, b| a.name.cmp(&b.name));
        timers
    }
}

impl Drop for TimerManager {
    fn drop(&mut self) {
        for active in self.timers.values() {
            active.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn manager() -> (TimerManager, mpsc::UnboundedReceiver<TimerFired>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback: ExpireCallback = Arc::new(move |fired| {
            let _ = tx.send(fired);
        });
        (TimerManager::new("s1", callback), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_once() {
        let (mut timers, mut rx) = manager();
        let (timer, replaced) = timers.start("step", Duration::from_millis(500), "inter-step delay");
        assert!(replaced.is_none());
        assert_eq!(timer.duration_ms, 500);

        let fired = rx.recv().await.unwrap();
        assert_eq!(fired.name, "step");
        assert_eq!(timers.complete(&fired), Some(timer));
        assert!(!timers.is_active("step"));
        // 重复处理同一到期不再完成
        assert_eq!(timers.complete(&fired), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reused_name_replaces_previous() {
        let (mut timers, mut rx) = manager();
        timers.start("cooldown", Duration::from_millis(100), "first");
        let (second, replaced) = timers.start("cooldown", Duration::from_millis(300), "second");
        assert_eq!(replaced.map(|t| t.reason), Some("first".to_string()));

        let fired = rx.recv().await.unwrap();
        let completed = timers.complete(&fired);
        assert_eq!(completed, Some(second));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err(), "replaced timer must not fire");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_generation_is_ignored() {
        let (mut timers, _rx) = manager();
        timers.start("step", Duration::from_millis(100), "a");
        let stale = TimerFired {
            session_id: "s1".to_string(),
            name: "step".to_string(),
            generation: 999,
        };
        assert_eq!(timers.complete(&stale), None);
        assert!(timers.is_active("step"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_prevents_firing() {
        let (mut timers, mut rx) = manager();
        timers.start("a", Duration::from_millis(100), "a");
        timers.start("b", Duration::from_millis(200), "b");
        let cancelled = timers.cancel_all();
        assert_eq!(cancelled.len(), 2);
        assert_eq!(cancelled[0].name, "a");
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());
        assert!(timers.active().is_empty());
    }
}
