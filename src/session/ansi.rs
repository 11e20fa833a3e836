//! 终端输出清洗：去掉 ANSI 转义序列，并计算用于「输出是否变化」判断的指纹

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

use regex::Regex;

fn ansi_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        // CSI / OSC（BEL 或 ST 结尾）/ 两字节转义
        Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]").ok()
    })
    .as_ref()
}

/// 去掉 ANSI 转义与回车
pub fn strip_ansi(input: &str) -> String {
    let cleaned = match ansi_regex() {
        Some(re) => re.replace_all(input, "").into_owned(),
        None => input.to_string(),
    };
    cleaned.replace('\r', "")
}

/// 清洗后文本的指纹；忽略行尾空白，避免光标重绘造成的伪变化
pub fn fingerprint(output: &str) -> u64 {
    let clean = strip_ansi(output);
    let mut hasher = DefaultHasher::new();
    for line in clean.lines() {
        line.trim_end().hash(&mut hasher);
    }
    hasher.finish()
}

/// 进度指纹只看这么多行智能体输出，顶部滚出窗口不算变化
const PROGRESS_TAIL_LINES: usize = 40;

/// 提示符、输入框边框、空白
fn is_input_chrome(c: char) -> bool {
    c.is_whitespace()
        || ('\u{2500}'..='\u{257f}').contains(&c)
        || matches!(c, '>' | '❯' | '›' | '$' | '#' | '%')
}

/// 判断「智能体是否有新输出」用的指纹
///
/// 去掉 `sent` 的回显后只剩提示符或边框的行不计入，所以终端回显输入本身不会改变指纹。
pub fn progress_fingerprint(output: &str, sent: &str) -> u64 {
    let clean = strip_ansi(output);
    let sent_lines: Vec<&str> = sent
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    let agent_lines: Vec<&str> = clean
        .lines()
        .filter(|line| {
            let mut rest = line.to_string();
            for sent_line in &sent_lines {
                rest = rest.replace(sent_line, "");
            }
            !rest.chars().all(is_input_chrome)
        })
        .collect();

    let start = agent_lines.len().saturating_sub(PROGRESS_TAIL_LINES);
    let mut hasher = DefaultHasher::new();
    for line in &agent_lines[start..] {
        line.trim_end().hash(&mut hasher);
    }
    hasher.finish()
}

/// 最后 n 个非空行
pub fn tail_lines(clean: &str, n: usize) -> Vec<&str> {
    let mut lines: Vec<&str> = clean
        .lines()
        .rev()
        .filter(|l| !l.trim().is_empty())
        .take(n)
        .collect();
    lines.reverse();
    lines
}
