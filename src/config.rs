//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `RESPAWN__*` 覆盖（双下划线表示嵌套，如 `RESPAWN__POLICY__CONFIRM_THRESHOLD=50`）。

use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;

use crate::llm::{LlmClient, OpenAiClient, OPENAI_DEFAULT_MODEL};
use crate::respawn::{AiChecker, AutomationConfig, LlmIdleChecker, RespawnPolicy};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub policy: RespawnPolicy,
    pub ai_check: AiCheckSection,
    /// 未显式提供配置时 enable 使用的默认 AutomationConfig
    pub defaults: AutomationConfig,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 自定义 preset 持久化文件；未设置时只在内存中保存
    pub presets_path: Option<PathBuf>,
}

/// [ai_check] 段：AI 空闲确认使用的 LLM 后端
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AiCheckSection {
    pub enabled: bool,
    /// deepseek / openai
    pub provider: String,
    pub model: Option<String>,
    pub base_url: Option<String>,
    /// 发送给模型的 transcript 尾部长度（字符）
    pub max_transcript_chars: usize,
}

impl Default for AiCheckSection {
    fn default() -> Self {
        Self {
            enabled: true,
            provider: "deepseek".to_string(),
            model: None,
            base_url: None,
            max_transcript_chars: 6_000,
        }
    }
}

/// 从 config 目录加载配置，环境变量 RESPAWN__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 RESPAWN__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("RESPAWN")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 根据配置与环境变量选择 AI 确认后端；没有 API Key 或被禁用时返回 None（AI 确认标记为 disabled）
pub fn create_ai_checker_from_config(cfg: &AppConfig) -> Option<Arc<dyn AiChecker>> {
    if !cfg.ai_check.enabled {
        tracing::info!("AI idle check disabled by config");
        return None;
    }
    let provider = cfg.ai_check.provider.to_lowercase();
    let deepseek_key = std::env::var("DEEPSEEK_API_KEY").ok();
    let openai_key = std::env::var("OPENAI_API_KEY").ok();

    let client = match (provider.as_str(), deepseek_key, openai_key) {
        (_, Some(key), _) | ("deepseek", None, Some(key)) => {
            OpenAiClient::deepseek(cfg.ai_check.model.as_deref(), &key)
        }
        (_, None, Some(key)) => OpenAiClient::new(
            cfg.ai_check.base_url.as_deref(),
            cfg.ai_check.model.as_deref().unwrap_or(OPENAI_DEFAULT_MODEL),
            &key,
        ),
        (_, None, None) => {
            tracing::warn!("No API key set, AI idle check disabled");
            return None;
        }
    };
    tracing::info!("AI idle check using {} ({})", provider, client.model());
    let llm: Arc<dyn LlmClient> = Arc::new(client);

    Some(Arc::new(LlmIdleChecker::new(
        llm,
        cfg.ai_check.max_transcript_chars,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_files() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.policy, RespawnPolicy::default());
        assert!(cfg.ai_check.enabled);
        assert!(cfg.defaults.validate().is_ok());
    }

    #[test]
    fn test_load_explicit_file_overrides_policy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("respawn.toml");
        std::fs::write(
            &path,
            r#"
[app]
name = "night-shift"

[policy]
confirm_threshold = 50
half_open_after = 3

[ai_check]
enabled = false
"#,
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.app.name.as_deref(), Some("night-shift"));
        assert_eq!(cfg.policy.confirm_threshold, 50);
        assert_eq!(cfg.policy.half_open_after, 3);
        assert_eq!(cfg.policy.conclusive_threshold, 85);
        assert_eq!(cfg.defaults, AutomationConfig::default());
        assert!(create_ai_checker_from_config(&cfg).is_none());
    }
}
