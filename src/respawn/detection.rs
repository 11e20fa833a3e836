//! 检测引擎：hook 信号 > AI 确认 > 启发式打分，取最高优先级，不做混合
//!
//! - hook（idle_prompt / stop）自上次评估以来到达 → 置信度 100，直接短路
//! - AI 确认只在启发式置信度处于模糊区间、且不在冷却中时发起；结果带代号，过期结果被丢弃
//! - AI 确认失败从不向调用方报错，只在快照里标记 disabled，并回落到启发式置信度

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use super::ai_check::AiVerdict;
use super::config::RespawnPolicy;
use super::heuristic::{IdleHeuristic, PatternHeuristic};
use crate::session::HookEvent;

/// 快照中的 hook 信号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HookSignal {
    None,
    IdlePrompt,
    Stop,
}

/// 置信度来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionSource {
    Heuristic,
    Hook,
    AiCheck,
}

/// AI 确认状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AiCheckStatus {
    Ready,
    Checking,
    Cooldown,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AiCheckSnapshot {
    pub status: AiCheckStatus,
    pub last_verdict: Option<AiVerdict>,
    pub last_check_time: Option<DateTime<Utc>>,
    pub cooldown_ends_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disabled_reason: Option<String>,
}

/// 一次评估的结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionSnapshot {
    pub confidence_level: u8,
    pub status_text: Option<String>,
    pub hook_signal: HookSignal,
    pub source: DetectionSource,
    pub ai_check: AiCheckSnapshot,
}

impl DetectionSnapshot {
    pub fn is_hook_confirmed(&self) -> bool {
        self.hook_signal != HookSignal::None
    }
}

/// 按策略阈值划分的判定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// 低于 confirm 阈值
    Working,
    /// 模糊区间
    Ambiguous,
    /// hook 确认或置信度饱和
    Idle,
}

/// AI 确认完成后的处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AiOutcome {
    Verdict {
        verdict: AiVerdict,
        cooldown: Duration,
        snapshot: DetectionSnapshot,
    },
    Failed {
        error: String,
        backoff: Duration,
        snapshot: DetectionSnapshot,
    },
}

#[derive(Debug, Clone)]
struct AiState {
    available: bool,
    generation: u64,
    in_flight: Option<u64>,
    last_verdict: Option<AiVerdict>,
    last_check_time: Option<DateTime<Utc>>,
    cooldown_until: Option<Instant>,
    cooldown_ends_at: Option<DateTime<Utc>>,
    disabled_reason: Option<String>,
}

/// 单会话检测引擎
pub struct DetectionEngine {
    heuristic: Box<dyn IdleHeuristic>,
    confirm_threshold: u8,
    conclusive_threshold: u8,
    cooldown_working: Duration,
    cooldown_idle: Duration,
    failure_backoff: Duration,
    pending_hook: HookSignal,
    last_heuristic: Option<(u8, Option<String>)>,
    ai: AiState,
}

impl std::fmt::Debug for DetectionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectionEngine")
            .field("pending_hook", &self.pending_hook)
            .field("ai", &self.ai)
            .finish()
    }
}

impl DetectionEngine {
    /// `ai_available` 为 false 时 AI 确认永久 disabled
    pub fn new(policy: &RespawnPolicy, ai_available: bool) -> Self {
        Self::with_heuristic(policy, ai_available, Box::new(PatternHeuristic::new()))
    }

    pub fn with_heuristic(
        policy: &RespawnPolicy,
        ai_available: bool,
        heuristic: Box<dyn IdleHeuristic>,
    ) -> Self {
        Self {
            heuristic,
            confirm_threshold: policy.confirm_threshold,
            conclusive_threshold: policy.conclusive_threshold,
            cooldown_working: Duration::from_millis(policy.ai_cooldown_working_ms),
            cooldown_idle: Duration::from_millis(policy.ai_cooldown_idle_ms),
            failure_backoff: Duration::from_millis(policy.ai_failure_backoff_ms),
            pending_hook: HookSignal::None,
            last_heuristic: None,
            ai: AiState {
                available: ai_available,
                generation: 0,
                in_flight: None,
                last_verdict: None,
                last_check_time: None,
                cooldown_until: None,
                cooldown_ends_at: None,
                disabled_reason: (!ai_available).then(|| "no AI checker configured".to_string()),
            },
        }
    }

    /// 记录 hook；只有 idle_prompt / stop 参与评估，stop 优先
    pub fn record_hook(&mut self, hook: HookEvent) {
        let signal = match hook {
            HookEvent::IdlePrompt => HookSignal::IdlePrompt,
            HookEvent::Stop => HookSignal::Stop,
            _ => return,
        };
        if self.pending_hook != HookSignal::Stop {
            self.pending_hook = signal;
        }
    }

    pub fn has_pending_hook(&self) -> bool {
        self.pending_hook != HookSignal::None
    }

    /// 评估一次：消费待处理 hook，否则用启发式打分
    pub fn evaluate(&mut self, output: &str, idle_timeout: Duration, now: Instant) -> DetectionSnapshot {
        let score = self.heuristic.score(output, idle_timeout, now);
        self.last_heuristic = Some((score.confidence, score.status_text.clone()));

        let hook = std::mem::replace(&mut self.pending_hook, HookSignal::None);
        if hook != HookSignal::None {
            let text = match hook {
                HookSignal::Stop => "stop hook received",
                _ => "idle prompt hook received",
            };
            return DetectionSnapshot {
                confidence_level: 100,
                status_text: Some(text.to_string()),
                hook_signal: hook,
                source: DetectionSource::Hook,
                ai_check: self.ai_snapshot(now),
            };
        }

        DetectionSnapshot {
            confidence_level: score.confidence,
            status_text: score.status_text,
            hook_signal: HookSignal::None,
            source: DetectionSource::Heuristic,
            ai_check: self.ai_snapshot(now),
        }
    }

    pub fn classify(&self, snapshot: &DetectionSnapshot) -> Verdict {
        if snapshot.is_hook_confirmed() || snapshot.confidence_level >= self.conclusive_threshold {
            Verdict::Idle
        } else if snapshot.confidence_level >= self.confirm_threshold {
            Verdict::Ambiguous
        } else {
            Verdict::Working
        }
    }

    /// 是否应发起 AI 确认：模糊区间、可用、未在进行、不在冷却
    pub fn should_ai_check(&self, snapshot: &DetectionSnapshot, now: Instant) -> bool {
        self.classify(snapshot) == Verdict::Ambiguous
            && self.ai.available
            && self.ai.in_flight.is_none()
            && !self.in_cooldown(now)
    }

    pub fn in_cooldown(&self, now: Instant) -> bool {
        self.ai.cooldown_until.is_some_and(|until| now < until)
    }

    /// 标记 AI 确认开始，返回本次代号
    pub fn begin_ai_check(&mut self) -> u64 {
        self.ai.generation += 1;
        self.ai.in_flight = Some(self.ai.generation);
        self.ai.generation
    }

    /// 作废进行中的 AI 确认（hook 抢先、停止等），之后到达的结果会被丢弃
    pub fn invalidate_ai_check(&mut self) -> bool {
        self.ai.generation += 1;
        self.ai.in_flight.take().is_some()
    }

    pub fn ai_in_flight(&self) -> bool {
        self.ai.in_flight.is_some()
    }

    /// 应用 AI 确认结果；代号不匹配返回 None
    pub fn complete_ai_check(
        &mut self,
        generation: u64,
        result: Result<AiVerdict, String>,
        now: Instant,
    ) -> Option<AiOutcome> {
        if self.ai.in_flight != Some(generation) {
            return None;
        }
        self.ai.in_flight = None;
        self.ai.last_check_time = Some(Utc::now());

        let (confidence, text) = self
            .last_heuristic
            .clone()
            .unwrap_or((0, None));

        match result {
            Ok(verdict) => {
                let cooldown = match verdict {
                    AiVerdict::Working => self.cooldown_working,
                    AiVerdict::Idle => self.cooldown_idle,
                };
                self.ai.last_verdict = Some(verdict);
                self.ai.disabled_reason = None;
                self.set_cooldown(now, cooldown);
                let snapshot = DetectionSnapshot {
                    confidence_level: match verdict {
                        AiVerdict::Idle => 100,
                        AiVerdict::Working => 0,
                    },
                    status_text: Some(format!("AI check: {}", verdict.as_str())),
                    hook_signal: HookSignal::None,
                    source: DetectionSource::AiCheck,
                    ai_check: self.ai_snapshot(now),
                };
                Some(AiOutcome::Verdict {
                    verdict,
                    cooldown,
                    snapshot,
                })
            }
            Err(error) => {
                self.ai.disabled_reason = Some(error.clone());
                self.set_cooldown(now, self.failure_backoff);
                let mut ai_check = self.ai_snapshot(now);
                ai_check.status = AiCheckStatus::Disabled;
                let snapshot = DetectionSnapshot {
                    confidence_level: confidence,
                    status_text: text,
                    hook_signal: HookSignal::None,
                    source: DetectionSource::Heuristic,
                    ai_check,
                };
                Some(AiOutcome::Failed {
                    error,
                    backoff: self.failure_backoff,
                    snapshot,
                })
            }
        }
    }

    /// 冷却定时器到期
    pub fn end_cooldown(&mut self) {
        self.ai.cooldown_until = None;
        self.ai.cooldown_ends_at = None;
    }

    /// 新周期：清除启发式计时
    pub fn start_new_cycle(&mut self) {
        self.heuristic.reset();
    }

    fn set_cooldown(&mut self, now: Instant, cooldown: Duration) {
        self.ai.cooldown_until = Some(now + cooldown);
        self.ai.cooldown_ends_at = chrono::Duration::from_std(cooldown)
            .ok()
            .map(|d| Utc::now() + d);
    }

    pub fn ai_snapshot(&self, now: Instant) -> AiCheckSnapshot {
        let status = if !self.ai.available {
            AiCheckStatus::Disabled
        } else if self.ai.in_flight.is_some() {
            AiCheckStatus::Checking
        } else if self.ai.disabled_reason.is_some() {
            AiCheckStatus::Disabled
        } else if self.in_cooldown(now) {
            AiCheckStatus::Cooldown
        } else {
            AiCheckStatus::Ready
        };
        AiCheckSnapshot {
            status,
            last_verdict: self.ai.last_verdict,
            last_check_time: self.ai.last_check_time,
            cooldown_ends_at: self.ai.cooldown_ends_at,
            disabled_reason: self.ai.disabled_reason.clone(),
        }
    }

    /// 无评估时的占位快照
    pub fn idle_snapshot(&self, now: Instant) -> DetectionSnapshot {
        let (confidence, text) = self.last_heuristic.clone().unwrap_or((0, None));
        DetectionSnapshot {
            confidence_level: confidence,
            status_text: text,
            hook_signal: self.pending_hook,
            source: DetectionSource::Heuristic,
            ai_check: self.ai_snapshot(now),
        }
    }
}
