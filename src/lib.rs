//! Respawn - 交互式 CLI 编码智能体的自动续跑控制器
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型与优雅关闭
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock），供 AI 空闲确认使用
//! - **observability**: 日志初始化
//! - **respawn**: 空闲检测、状态机、熔断、定时器、动作日志、preset
//! - **session**: 会话 I/O 接口与 tmux / 内存实现

pub mod config;
pub mod core;
pub mod llm;
pub mod observability;
pub mod respawn;
pub mod session;

pub use respawn::{RespawnEvent, RespawnManager};
