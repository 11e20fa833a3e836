//! 熔断器：连续无进展周期 → CLOSED → HALF_OPEN → OPEN
//!
//! HALF_OPEN 只是「卡住」告警，自动化继续；OPEN 会让控制器停止，且只有显式 reset 才能回到 CLOSED。

use serde::{Deserialize, Serialize};

/// 熔断器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    HalfOpen,
    Open,
}

/// 对外可见的熔断器快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerState {
    pub state: CircuitState,
    pub reason: Option<String>,
    pub consecutive_no_progress: u32,
}

impl Default for CircuitBreakerState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            reason: None,
            consecutive_no_progress: 0,
        }
    }
}

/// 记录一次周期后的状态变化
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerTransition {
    Unchanged,
    /// CLOSED → HALF_OPEN
    Stuck,
    /// HALF_OPEN → OPEN
    Tripped,
    /// HALF_OPEN → CLOSED（重新出现进展）
    Recovered,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitBreakerState,
    half_open_after: u32,
    open_after: u32,
}

impl CircuitBreaker {
    /// `half_open_after` 次连续无进展进入 HALF_OPEN，再 `open_after` 次进入 OPEN
    pub fn new(half_open_after: u32, open_after: u32) -> Self {
        Self {
            state: CircuitBreakerState::default(),
            half_open_after: half_open_after.max(1),
            open_after: open_after.max(1),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state.state
    }

    pub fn snapshot(&self) -> CircuitBreakerState {
        self.state.clone()
    }

    pub fn is_open(&self) -> bool {
        self.state.state == CircuitState::Open
    }

    /// 记录一个已完成周期是否有可观察进展；OPEN 之后不再变化
    pub fn record_cycle(&mut self, progress: bool) -> BreakerTransition {
        match (self.state.state, progress) {
            (CircuitState::Open, _) => BreakerTransition::Unchanged,
            (CircuitState::Closed, true) => {
                self.state.consecutive_no_progress = 0;
                BreakerTransition::Unchanged
            }
            (CircuitState::HalfOpen, true) => {
                self.state = CircuitBreakerState::default();
                BreakerTransition::Recovered
            }
            (current, false) => {
                self.state.consecutive_no_progress += 1;
                let count = self.state.consecutive_no_progress;
                if current == CircuitState::Closed && count >= self.half_open_after {
                    self.state.state = CircuitState::HalfOpen;
                    self.state.reason = Some(format!("{count} consecutive cycles without progress"));
                    BreakerTransition::Stuck
                } else if current == CircuitState::HalfOpen
                    && count >= self.half_open_after + self.open_after
                {
                    self.state.state = CircuitState::Open;
                    self.state.reason = Some(format!(
                        "{count} consecutive cycles without progress; automation halted"
                    ));
                    BreakerTransition::Tripped
                } else {
                    BreakerTransition::Unchanged
                }
            }
        }
    }

    /// 唯一的外部修改入口：回到 CLOSED，不会自行恢复自动化
    pub fn reset(&mut self) {
        self.state = CircuitBreakerState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_keeps_closed() {
        let mut cb = CircuitBreaker::new(2, 1);
        for _ in 0..10 {
            assert_eq!(cb.record_cycle(true), BreakerTransition::Unchanged);
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_then_open() {
        let mut cb = CircuitBreaker::new(3, 2);
        assert_eq!(cb.record_cycle(false), BreakerTransition::Unchanged);
        assert_eq!(cb.record_cycle(false), BreakerTransition::Unchanged);
        assert_eq!(cb.record_cycle(false), BreakerTransition::Stuck);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.record_cycle(false), BreakerTransition::Unchanged);
        assert_eq!(cb.record_cycle(false), BreakerTransition::Tripped);
        assert!(cb.is_open());
        // OPEN 为终态
        assert_eq!(cb.record_cycle(true), BreakerTransition::Unchanged);
        assert!(cb.is_open());
    }

    #[test]
    fn test_progress_resets_counter() {
        let mut cb = CircuitBreaker::new(2, 1);
        cb.record_cycle(false);
        cb.record_cycle(true);
        assert_eq!(cb.record_cycle(false), BreakerTransition::Unchanged);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_recovers_on_progress() {
        let mut cb = CircuitBreaker::new(1, 3);
        assert_eq!(cb.record_cycle(false), BreakerTransition::Stuck);
        assert_eq!(cb.record_cycle(true), BreakerTransition::Recovered);
        assert_eq!(cb.snapshot(), CircuitBreakerState::default());
    }

    #[test]
    fn test_reset_restores_closed() {
        let mut cb = CircuitBreaker::new(1, 1);
        cb.record_cycle(false);
        cb.record_cycle(false);
        assert!(cb.is_open());
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().consecutive_no_progress, 0);
    }
}
