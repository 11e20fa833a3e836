//! 自动化配置：每个会话一份 AutomationConfig，外加全局可调的 RespawnPolicy
//!
//! AutomationConfig 整体读写（put 即整体替换），在进入状态机前由 validate 校验；
//! RespawnPolicy 汇集检测阈值、熔断次数、AI 冷却等策略常量，全部可通过 [policy] 配置段覆盖。

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::action_log::DEFAULT_ACTION_LOG_CAPACITY;
use crate::core::RespawnError;

/// idleTimeoutMs 允许范围
const MIN_IDLE_TIMEOUT_MS: u64 = 1_000;
const MAX_IDLE_TIMEOUT_MS: u64 = 3_600_000;
const MAX_INTER_STEP_DELAY_MS: u64 = 600_000;
/// 定时运行最长一周
const MAX_DURATION_MINUTES: u32 = 7 * 24 * 60;

/// 单个会话的自动化配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AutomationConfig {
    /// 推动智能体继续工作的提示
    pub update_prompt: String,
    /// 发送 update 前是否先清空上下文
    pub send_clear: bool,
    /// 发送 update 前是否先重新初始化
    pub send_init: bool,
    /// 循环尚未产出任何内容时使用的启动提示
    pub kickstart_prompt: Option<String>,
    /// 自动确认计划 / 权限提示
    pub auto_accept_prompts: bool,
    pub idle_timeout_ms: u64,
    pub inter_step_delay_ms: u64,
    /// 定时运行：到点后自动停止
    pub duration_minutes: Option<u32>,
    /// 转交给会话侧 token 阈值监视器，状态机本身不解读
    pub context_limits: ContextLimits,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            update_prompt: "continue".to_string(),
            send_clear: false,
            send_init: false,
            kickstart_prompt: None,
            auto_accept_prompts: false,
            idle_timeout_ms: 10_000,
            inter_step_delay_ms: 2_000,
            duration_minutes: None,
            context_limits: ContextLimits::default(),
        }
    }
}

/// 自动压缩 / 自动清空的 token 阈值
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContextLimits {
    pub auto_compact_threshold: Option<u64>,
    pub auto_clear_threshold: Option<u64>,
}

impl ContextLimits {
    pub fn is_empty(&self) -> bool {
        self.auto_compact_threshold.is_none() && self.auto_clear_threshold.is_none()
    }
}

impl AutomationConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn inter_step_delay(&self) -> Duration {
        Duration::from_millis(self.inter_step_delay_ms)
    }

    /// 非空的 kickstart 提示
    pub fn kickstart(&self) -> Option<&str> {
        self.kickstart_prompt.as_deref().filter(|p| !p.trim().is_empty())
    }

    /// 校验整份配置；任何不合法字段都直接拒绝，不做静默修正
    pub fn validate(&self) -> Result<(), RespawnError> {
        if self.update_prompt.trim().is_empty() {
            return Err(RespawnError::InvalidConfig(
                "updatePrompt must not be empty".to_string(),
            ));
        }
        if let Some(kick) = &self.kickstart_prompt {
            if kick.trim().is_empty() {
                return Err(RespawnError::InvalidConfig(
                    "kickstartPrompt must be omitted or non-empty".to_string(),
                ));
            }
        }
        if !(MIN_IDLE_TIMEOUT_MS..=MAX_IDLE_TIMEOUT_MS).contains(&self.idle_timeout_ms) {
            return Err(RespawnError::InvalidConfig(format!(
                "idleTimeoutMs must be within {}..={} (got {})",
                MIN_IDLE_TIMEOUT_MS, MAX_IDLE_TIMEOUT_MS, self.idle_timeout_ms
            )));
        }
        if self.inter_step_delay_ms > MAX_INTER_STEP_DELAY_MS {
            return Err(RespawnError::InvalidConfig(format!(
                "interStepDelayMs must be at most {} (got {})",
                MAX_INTER_STEP_DELAY_MS, self.inter_step_delay_ms
            )));
        }
        if let Some(minutes) = self.duration_minutes {
            validate_duration_minutes(minutes)?;
        }
        for (name, value) in [
            ("autoCompactThreshold", self.context_limits.auto_compact_threshold),
            ("autoClearThreshold", self.context_limits.auto_clear_threshold),
        ] {
            if value == Some(0) {
                return Err(RespawnError::InvalidConfig(format!(
                    "{name} must be positive when set"
                )));
            }
        }
        Ok(())
    }
}

pub(crate) fn validate_duration_minutes(minutes: u32) -> Result<(), RespawnError> {
    if minutes == 0 || minutes > MAX_DURATION_MINUTES {
        return Err(RespawnError::InvalidConfig(format!(
            "durationMinutes must be within 1..={} (got {})",
            MAX_DURATION_MINUTES, minutes
        )));
    }
    Ok(())
}

/// 策略常量（[policy] 段），阈值与次数均可调
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RespawnPolicy {
    /// 检测轮询间隔
    pub poll_interval_ms: u64,
    /// 置信度达到该值进入 confirming_idle
    pub confirm_threshold: u8,
    /// 置信度达到该值视为确定空闲；两者之间为模糊区间，允许 AI 确认
    pub conclusive_threshold: u8,
    /// confirming_idle 的确认窗口
    pub confirm_window_ms: u64,
    /// 连续 N 次无进展 → HALF_OPEN
    pub half_open_after: u32,
    /// HALF_OPEN 后再连续 M 次无进展 → OPEN
    pub open_after: u32,
    /// AI 判定 WORKING 后的冷却（较长，避免反复打扰）
    pub ai_cooldown_working_ms: u64,
    /// AI 判定 IDLE 后的冷却
    pub ai_cooldown_idle_ms: u64,
    /// AI 确认失败后的退避
    pub ai_failure_backoff_ms: u64,
    pub ai_check_timeout_ms: u64,
    /// waiting_* 超时 = interStepDelayMs × factor（至少 idleTimeoutMs）
    pub wait_timeout_factor: u32,
    /// monitoring_init 的最长等待
    pub init_monitor_ms: u64,
    pub action_log_capacity: usize,
}

impl Default for RespawnPolicy {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            confirm_threshold: 40,
            conclusive_threshold: 85,
            confirm_window_ms: 3_000,
            half_open_after: 2,
            open_after: 1,
            ai_cooldown_working_ms: 180_000,
            ai_cooldown_idle_ms: 30_000,
            ai_failure_backoff_ms: 60_000,
            ai_check_timeout_ms: 90_000,
            wait_timeout_factor: 5,
            init_monitor_ms: 30_000,
            action_log_capacity: DEFAULT_ACTION_LOG_CAPACITY,
        }
    }
}

impl RespawnPolicy {
    pub fn validate(&self) -> Result<(), RespawnError> {
        if self.confirm_threshold == 0
            || self.confirm_threshold >= self.conclusive_threshold
            || self.conclusive_threshold > 100
        {
            return Err(RespawnError::InvalidConfig(format!(
                "policy thresholds must satisfy 0 < confirm ({}) < conclusive ({}) <= 100",
                self.confirm_threshold, self.conclusive_threshold
            )));
        }
        if self.half_open_after == 0 || self.open_after == 0 {
            return Err(RespawnError::InvalidConfig(
                "circuit breaker counts must be positive".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 || self.wait_timeout_factor == 0 {
            return Err(RespawnError::InvalidConfig(
                "poll interval and wait timeout factor must be positive".to_string(),
            ));
        }
        if !(1..=DEFAULT_ACTION_LOG_CAPACITY).contains(&self.action_log_capacity) {
            return Err(RespawnError::InvalidConfig(format!(
                "action log capacity must be between 1 and {} (got {})",
                DEFAULT_ACTION_LOG_CAPACITY, self.action_log_capacity
            )));
        }
        Ok(())
    }

    /// 轮询间隔不超过 idleTimeoutMs
    pub fn poll_interval(&self, config: &AutomationConfig) -> Duration {
        Duration::from_millis(self.poll_interval_ms.min(config.idle_timeout_ms).max(1))
    }

    /// waiting_* 的隐式超时
    pub fn wait_timeout(&self, config: &AutomationConfig) -> Duration {
        let scaled = config
            .inter_step_delay_ms
            .saturating_mul(u64::from(self.wait_timeout_factor));
        Duration::from_millis(scaled.max(config.idle_timeout_ms))
    }
}
