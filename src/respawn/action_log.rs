//! 动作日志：每会话一个有界环形缓冲，只保留「有意义」的自动化事件，供事后诊断
//!
//! 过滤在插入时完成：command / hook 总是保留；ai-check / plan-check / transcript 只有带判定结果时才保留。
//! 状态机从不读取这里的内容。

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

/// 默认容量，也是上限
pub const DEFAULT_ACTION_LOG_CAPACITY: usize = 30;

/// 日志条目类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    Command,
    Hook,
    AiCheck,
    PlanCheck,
    Transcript,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionLogEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: ActionKind,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict: Option<String>,
}

impl ActionLogEntry {
    pub fn new(kind: ActionKind, detail: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            detail: detail.into(),
            verdict: None,
        }
    }

    pub fn with_verdict(mut self, verdict: impl Into<String>) -> Self {
        self.verdict = Some(verdict.into());
        self
    }

    /// 是否属于白名单
    pub fn is_interesting(&self) -> bool {
        match self.kind {
            ActionKind::Command | ActionKind::Hook => true,
            ActionKind::AiCheck | ActionKind::PlanCheck | ActionKind::Transcript => {
                self.verdict.is_some()
            }
        }
    }
}

/// 单会话环形缓冲
#[derive(Debug, Clone)]
pub struct ActionLog {
    entries: VecDeque<ActionLogEntry>,
    capacity: usize,
}

impl ActionLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, DEFAULT_ACTION_LOG_CAPACITY);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// 写入；不在白名单中的条目返回 false 且不保存
    pub fn append(&mut self, entry: ActionLogEntry) -> bool {
        if !entry.is_interesting() {
            return false;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
        true
    }

    /// 最新在前
    pub fn list(&self) -> Vec<ActionLogEntry> {
        self.entries.iter().rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ActionLog {
    fn default() -> Self {
        Self::new(DEFAULT_ACTION_LOG_CAPACITY)
    }
}

/// 所有会话的动作日志（控制器停止后仍保留，便于诊断）
#[derive(Debug)]
pub struct ActionLogStore {
    logs: RwLock<HashMap<String, ActionLog>>,
    capacity: usize,
}

impl ActionLogStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            logs: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// 写入并返回是否被保留
    pub async fn append(&self, session_id: &str, entry: ActionLogEntry) -> bool {
        if !entry.is_interesting() {
            return false;
        }
        let mut logs = self.logs.write().await;
        logs.entry(session_id.to_string())
            .or_insert_with(|| ActionLog::new(self.capacity))
            .append(entry)
    }

    pub async fn list(&self, session_id: &str) -> Vec<ActionLogEntry> {
        self.logs
            .read()
            .await
            .get(session_id)
            .map(ActionLog::list)
            .unwrap_or_default()
    }

    pub async fn clear(&self, session_id: &str) {
        self.logs.write().await.remove(session_id);
    }
}

impl Default for ActionLogStore {
    fn default() -> Self {
        Self::new(DEFAULT_ACTION_LOG_CAPACITY)
    }
}
