//! 配置存储：每会话 AutomationConfig + 命名 preset 库
//!
//! preset 分两类：内置（BuiltIn，只读）与用户自定义（Custom，可删、可持久化到 TOML）。
//! 「内置不可删除」由类型保证：PresetLibrary 只对 CustomPreset 提供删除路径。
//! 应用 preset 只是把其配置复制进会话配置，preset 本身永不被修改。

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::config::{validate_duration_minutes, AutomationConfig};
use crate::core::RespawnError;

/// preset 的公共内容（不含身份以外的元数据）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresetBody {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<u32>,
    pub config: AutomationConfig,
}

impl PresetBody {
    /// 生成可直接写入会话的配置；preset 的时长优先于配置里自带的时长
    pub fn to_config(&self) -> AutomationConfig {
        let mut config = self.config.clone();
        config.duration_minutes = self.duration_minutes.or(config.duration_minutes);
        config
    }
}

/// 内置 preset：随程序发布，只读
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuiltInPreset(PresetBody);

impl BuiltInPreset {
    pub fn body(&self) -> &PresetBody {
        &self.0
    }
}

/// 用户自定义 preset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomPreset {
    pub created_at: DateTime<Utc>,
    pub body: PresetBody,
}

/// 对外暴露的 preset 视图
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "preset", rename_all = "snake_case")]
pub enum Preset {
    BuiltIn(BuiltInPreset),
    Custom(CustomPreset),
}

impl Preset {
    pub fn body(&self) -> &PresetBody {
        match self {
            Preset::BuiltIn(p) => p.body(),
            Preset::Custom(p) => &p.body,
        }
    }

    pub fn id(&self) -> &str {
        &self.body().id
    }

    pub fn name(&self) -> &str {
        &self.body().name
    }

    pub fn is_builtin(&self) -> bool {
        matches!(self, Preset::BuiltIn(_))
    }

    pub fn to_config(&self) -> AutomationConfig {
        self.body().to_config()
    }
}

fn builtin(
    id: &str,
    name: &str,
    description: &str,
    duration_minutes: Option<u32>,
    config: AutomationConfig,
) -> BuiltInPreset {
    BuiltInPreset(PresetBody {
        id: format!("builtin:{id}"),
        name: name.to_string(),
        description: Some(description.to_string()),
        duration_minutes,
        config,
    })
}

/// 内置 preset 列表
pub fn builtin_presets() -> Vec<BuiltInPreset> {
    vec![
        builtin(
            "solo-work",
            "Solo work",
            "Nudge the agent to keep going on the current task",
            None,
            AutomationConfig {
                update_prompt: "Continue working on the current task. If it is done, move on to the next item.".to_string(),
                ..Default::default()
            },
        ),
        builtin(
            "fresh-context",
            "Fresh context",
            "Clear and re-initialise context before every nudge",
            None,
            AutomationConfig {
                update_prompt: "Review the current progress notes and continue with the next step.".to_string(),
                send_clear: true,
                send_init: true,
                idle_timeout_ms: 15_000,
                inter_step_delay_ms: 3_000,
                ..Default::default()
            },
        ),
        builtin(
            "kickstart-loop",
            "Kickstart loop",
            "Bootstrap with a start prompt, then keep nudging",
            None,
            AutomationConfig {
                kickstart_prompt: Some(
                    "Read the task list and start working on the first open item.".to_string(),
                ),
                ..Default::default()
            },
        ),
        builtin(
            "overnight-autonomous",
            "Overnight autonomous",
            "Eight-hour unattended run with auto-accepted prompts",
            Some(480),
            AutomationConfig {
                update_prompt: "Continue autonomously. Commit finished work and pick the next task.".to_string(),
                send_clear: true,
                auto_accept_prompts: true,
                idle_timeout_ms: 20_000,
                inter_step_delay_ms: 5_000,
                ..Default::default()
            },
        ),
    ]
}

/// 持久化文件格式：只保存自定义 preset
#[derive(Debug, Default, Serialize, Deserialize)]
struct PresetFile {
    #[serde(default)]
    presets: Vec<CustomPreset>,
}

/// preset 库：内置 + 自定义，可选 TOML 持久化
#[derive(Debug)]
pub struct PresetLibrary {
    builtin: Vec<BuiltInPreset>,
    custom: Vec<CustomPreset>,
    path: Option<PathBuf>,
}

impl Default for PresetLibrary {
    fn default() -> Self {
        Self::new()
    }
}

impl PresetLibrary {
    /// 仅内存，不持久化
    pub fn new() -> Self {
        Self {
            builtin: builtin_presets(),
            custom: Vec::new(),
            path: None,
        }
    }

    /// 从 TOML 文件加载自定义 preset；文件不存在时为空库，之后的修改会写回该文件
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RespawnError> {
        let path = path.as_ref().to_path_buf();
        let custom = if path.exists() {
            let data = std::fs::read_to_string(&path)?;
            let file: PresetFile = toml::from_str(&data)?;
            for preset in &file.presets {
                preset.body.config.validate()?;
            }
            file.presets
        } else {
            Vec::new()
        };
        tracing::debug!("Loaded {} custom presets from {:?}", custom.len(), path);
        Ok(Self {
            builtin: builtin_presets(),
            custom,
            path: Some(path),
        })
    }

    /// 内置在前，自定义按创建顺序
    pub fn list(&self) -> Vec<Preset> {
        self.builtin
            .iter()
            .cloned()
            .map(Preset::BuiltIn)
            .chain(self.custom.iter().cloned().map(Preset::Custom))
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<Preset> {
        self.list().into_iter().find(|p| p.id() == id)
    }

    /// 保存当前配置为新的自定义 preset
    pub fn save(
        &mut self,
        config: &AutomationConfig,
        name: &str,
        duration_minutes: Option<u32>,
    ) -> Result<CustomPreset, RespawnError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RespawnError::InvalidConfig(
                "preset name must not be empty".to_string(),
            ));
        }
        config.validate()?;
        if let Some(minutes) = duration_minutes {
            validate_duration_minutes(minutes)?;
        }

        let preset = CustomPreset {
            created_at: Utc::now(),
            body: PresetBody {
                id: format!("preset_{}", uuid::Uuid::new_v4()),
                name: name.to_string(),
                description: None,
                duration_minutes,
                config: config.clone(),
            },
        };
        self.custom.push(preset.clone());
        self.persist()?;
        tracing::info!("Saved preset '{}' ({})", preset.body.name, preset.body.id);
        Ok(preset)
    }

    /// 删除自定义 preset；内置 preset 返回 PermissionDenied
    pub fn delete(&mut self, id: &str) -> Result<CustomPreset, RespawnError> {
        if self.builtin.iter().any(|p| p.body().id == id) {
            return Err(RespawnError::PermissionDenied(format!(
                "built-in preset {id} cannot be deleted"
            )));
        }
        let index = self
            .custom
            .iter()
            .position(|p| p.body.id == id)
            .ok_or_else(|| RespawnError::PresetNotFound(id.to_string()))?;
        let removed = self.custom.remove(index);
        self.persist()?;
        tracing::info!("Deleted preset '{}' ({})", removed.body.name, id);
        Ok(removed)
    }

    fn persist(&self) -> Result<(), RespawnError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = PresetFile {
            presets: self.custom.clone(),
        };
        std::fs::write(path, toml::to_string_pretty(&file)?)?;
        Ok(())
    }
}

/// 配置存储：会话配置整体替换；preset 库带锁共享
#[derive(Debug, Default)]
pub struct ConfigStore {
    configs: RwLock<HashMap<String, AutomationConfig>>,
    presets: RwLock<PresetLibrary>,
}

impl ConfigStore {
    pub fn new(presets: PresetLibrary) -> Self {
        Self {
            configs: RwLock::new(HashMap::new()),
            presets: RwLock::new(presets),
        }
    }

    pub async fn get(&self, session_id: &str) -> Option<AutomationConfig> {
        self.configs.read().await.get(session_id).cloned()
    }

    /// 整体替换；校验失败时旧配置保持不变
    pub async fn put(&self, session_id: &str, config: AutomationConfig) -> Result<(), RespawnError> {
        config.validate()?;
        self.configs
            .write()
            .await
            .insert(session_id.to_string(), config);
        Ok(())
    }

    pub async fn remove(&self, session_id: &str) -> Option<AutomationConfig> {
        self.configs.write().await.remove(session_id)
    }

    pub async fn list_presets(&self) -> Vec<Preset> {
        self.presets.read().await.list()
    }

    pub async fn get_preset(&self, id: &str) -> Option<Preset> {
        self.presets.read().await.get(id)
    }

    pub async fn save_preset(
        &self,
        config: &AutomationConfig,
        name: &str,
        duration_minutes: Option<u32>,
    ) -> Result<CustomPreset, RespawnError> {
        self.presets.write().await.save(config, name, duration_minutes)
    }

    pub async fn delete_preset(&self, id: &str) -> Result<CustomPreset, RespawnError> {
        self.presets.write().await.delete(id)
    }

    /// 把 preset 复制进会话配置，返回写入后的配置
    pub async fn apply_preset(
        &self,
        session_id: &str,
        preset_id: &str,
    ) -> Result<AutomationConfig, RespawnError> {
        let preset = self
            .get_preset(preset_id)
            .await
            .ok_or_else(|| RespawnError::PresetNotFound(preset_id.to_string()))?;
        let config = preset.to_config();
        self.put(session_id, config.clone()).await?;
        Ok(config)
    }
}
