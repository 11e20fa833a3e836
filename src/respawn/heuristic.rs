//! 输出模式启发式：根据最近输出窗口给出 0-100 的空闲置信度与提示文本
//!
//! 规则（取值上限 100）：
//! - 输出与上次不同 → 0（计时重置）
//! - 尾部出现工作中标志（spinner、"esc to interrupt" 等）→ 5
//! - 静默时长 / idleTimeout 最多贡献 60；超过 3 倍 idleTimeout 再加 30
//! - 尾部可见输入提示符再加 40

use std::time::Duration;

use regex::Regex;
use tokio::time::Instant;

use crate::session::ansi::{fingerprint, strip_ansi, tail_lines};

/// 检查尾部的行数
const TAIL_LINES: usize = 6;
const SILENCE_WEIGHT: f64 = 60.0;
const LONG_SILENCE_BONUS: u8 = 30;
const LONG_SILENCE_RATIO: f64 = 3.0;
const PROMPT_BONUS: u8 = 40;
const WORKING_CONFIDENCE: u8 = 5;

/// 启发式打分结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeuristicScore {
    pub confidence: u8,
    pub status_text: Option<String>,
}

/// 被动输出分析器；实现可以有状态（例如记录上次输出）
pub trait IdleHeuristic: Send + Sync {
    fn score(&mut self, output: &str, idle_timeout: Duration, now: Instant) -> HeuristicScore;

    /// 新周期开始时调用，清除静默计时
    fn reset(&mut self) {}
}

/// 默认实现：正则模式 + 静默计时
#[derive(Debug)]
pub struct PatternHeuristic {
    working: Vec<Regex>,
    prompt: Vec<Regex>,
    last_fingerprint: Option<u64>,
    quiet_since: Option<Instant>,
}

impl Default for PatternHeuristic {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternHeuristic {
    pub fn new() -> Self {
        let working = [
            r"(?i)esc to interrupt",
            r"(?i)ctrl\+c to (?:interrupt|cancel)",
            r"[✻✽✢✶✳·*]\s+\w+…",
            r"[⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏]",
            r"(?i)\b(?:thinking|running|compacting)\.\.\.",
        ];
        let prompt = [
            r"^\s*[>❯›]\s*$",
            r"^\s*│\s*[>❯]\s*",
            r"(?i)\? for shortcuts",
            r"(?i)^\s*[>❯]\s+try ",
        ];
        Self {
            working: working
                .iter()
                .filter_map(|p| Regex::new(p).ok())
                .collect(),
            prompt: prompt.iter().filter_map(|p| Regex::new(p).ok()).collect(),
            last_fingerprint: None,
            quiet_since: None,
        }
    }

    fn find_working<'a>(&self, tail: &[&'a str]) -> Option<&'a str> {
        tail.iter()
            .copied()
            .find(|line| self.working.iter().any(|re| re.is_match(line)))
    }

    fn prompt_visible(&self, tail: &[&str]) -> bool {
        tail.iter()
            .any(|line| self.prompt.iter().any(|re| re.is_match(line)))
    }
}

impl IdleHeuristic for PatternHeuristic {
    fn score(&mut self, output: &str, idle_timeout: Duration, now: Instant) -> HeuristicScore {
        let fp = fingerprint(output);
        if self.last_fingerprint != Some(fp) {
            self.last_fingerprint = Some(fp);
            self.quiet_since = Some(now);
            return HeuristicScore {
                confidence: 0,
                status_text: Some("output changing".to_string()),
            };
        }

        let clean = strip_ansi(output);
        let tail = tail_lines(&clean, TAIL_LINES);
        if let Some(line) = self.find_working(&tail) {
            return HeuristicScore {
                confidence: WORKING_CONFIDENCE,
                status_text: Some(format!("working: {}", line.trim())),
            };
        }

        let silence = self
            .quiet_since
            .map(|since| now.saturating_duration_since(since))
            .unwrap_or_default();
        let ratio = if idle_timeout.is_zero() {
            LONG_SILENCE_RATIO
        } else {
            silence.as_secs_f64() / idle_timeout.as_secs_f64()
        };

        let mut confidence = (SILENCE_WEIGHT * ratio.min(1.0)).round() as u8;
        if ratio >= LONG_SILENCE_RATIO {
            confidence = confidence.saturating_add(LONG_SILENCE_BONUS);
        }
        let prompt = self.prompt_visible(&tail);
        if prompt {
            confidence = confidence.saturating_add(PROMPT_BONUS);
        }

        HeuristicScore {
            confidence: confidence.min(100),
            status_text: Some(format!(
                "silent {}s{}",
                silence.as_secs(),
                if prompt { ", prompt visible" } else { "" }
            )),
        }
    }

    fn reset(&mut self) {
        self.last_fingerprint = None;
        self.quiet_since = None;
    }
}
