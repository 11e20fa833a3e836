//! Respawn - 交互式 CLI 编码智能体的自动续跑控制器
//!
//! 入口：加载配置、连接 tmux 会话并启用自动化；stdin 接收行命令（hook 投递、停止、查询），
//! stdout 以 JSON 行输出生命周期事件，日志走 stderr。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

use respawn::config::{create_ai_checker_from_config, load_config, AppConfig};
use respawn::core::{run_until_shutdown, ShutdownSignal, DEFAULT_DRAIN_TIMEOUT};
use respawn::respawn::{ConfigStore, PresetLibrary, RespawnManager};
use respawn::session::{HookEvent, TmuxSession};

#[derive(Parser)]
#[command(name = "respawn")]
#[command(about = "Keep an interactive coding agent working in a tmux pane")]
struct Cli {
    /// tmux target pane (e.g. work:0.1)
    #[arg(short, long)]
    target: String,

    /// Preset to apply before enabling (e.g. builtin:solo-work)
    #[arg(short, long)]
    preset: Option<String>,

    /// Stop automatically after this many minutes
    #[arg(short, long)]
    duration: Option<u32>,

    /// Extra config file layered over config/default.toml
    #[arg(short, long)]
    config: Option<PathBuf>,
}

/// stdin 行命令
#[derive(Debug, PartialEq)]
enum LineCommand {
    Hook(HookEvent),
    Stop,
    Reset,
    Status,
    Log,
    Presets,
    Apply(String),
    Blocked(String),
    Exit,
}

impl std::str::FromStr for LineCommand {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (verb, rest) = line
            .split_once(char::is_whitespace)
            .map(|(v, r)| (v, r.trim()))
            .unwrap_or((line, ""));
        match verb {
            "hook" => rest.parse().map(LineCommand::Hook),
            "stop" => Ok(LineCommand::Stop),
            "reset" => Ok(LineCommand::Reset),
            "status" => Ok(LineCommand::Status),
            "log" => Ok(LineCommand::Log),
            "presets" => Ok(LineCommand::Presets),
            "apply" if !rest.is_empty() => Ok(LineCommand::Apply(rest.to_string())),
            "blocked" => Ok(LineCommand::Blocked(if rest.is_empty() {
                "reported blocked".to_string()
            } else {
                rest.to_string()
            })),
            "exit" | "quit" => Ok(LineCommand::Exit),
            other => Err(format!("unknown command: {other}")),
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(line) => println!("{line}"),
        Err(e) => tracing::warn!("Failed to serialize output: {}", e),
    }
}

/// 把事件流以 JSON 行写到 stdout
async fn print_events(mut rx: broadcast::Receiver<respawn::RespawnEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => print_json(&event),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("Event printer lagged, {} events dropped", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// 返回 false 表示退出
async fn handle_line(manager: &RespawnManager, target: &str, command: LineCommand) -> bool {
    let result = match command {
        LineCommand::Hook(hook) => manager.deliver_hook(target, hook).await,
        LineCommand::Stop => manager.stop(target).await.map(|status| print_json(&status)),
        LineCommand::Reset => {
            let state = manager.reset_circuit_breaker(target).await;
            print_json(&state);
            Ok(())
        }
        LineCommand::Status => {
            match manager.status(target).await {
                Some(status) => print_json(&status),
                None => println!("null"),
            }
            Ok(())
        }
        LineCommand::Log => {
            print_json(&manager.action_log(target).await);
            Ok(())
        }
        LineCommand::Presets => {
            let presets = manager.list_presets().await;
            print_json(&presets);
            Ok(())
        }
        LineCommand::Apply(preset) => manager
            .apply_preset(target, &preset)
            .await
            .map(|config| print_json(&config)),
        LineCommand::Blocked(details) => manager.report_blocked(target, &details).await,
        LineCommand::Exit => return false,
    };
    if let Err(e) = result {
        tracing::warn!("Command failed: {}", e);
        eprintln!("error: {e}");
    }
    true
}

async fn read_commands(manager: Arc<RespawnManager>, target: String) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => match line.parse::<LineCommand>() {
                Ok(command) => {
                    if !handle_line(&manager, &target, command).await {
                        break;
                    }
                }
                Err(e) => eprintln!("error: {e}"),
            },
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("Reading stdin failed: {}", e);
                break;
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    respawn::observability::init();
    let cli = Cli::parse();

    let cfg = load_config(cli.config.clone()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    cfg.policy.validate().context("Invalid [policy] section")?;

    if !TmuxSession::available().await {
        anyhow::bail!("tmux is not installed or not on PATH");
    }

    let presets = match &cfg.app.presets_path {
        Some(path) => PresetLibrary::load(path).context("Failed to load preset library")?,
        None => PresetLibrary::new(),
    };
    let manager = Arc::new(RespawnManager::new(
        Arc::new(TmuxSession::new()),
        create_ai_checker_from_config(&cfg),
        cfg.policy.clone(),
        ConfigStore::new(presets),
    ));

    let printer = tokio::spawn(print_events(manager.subscribe()));

    let status = match &cli.preset {
        Some(preset) => manager
            .enable_with_preset(&cli.target, preset, cli.duration)
            .await,
        None => {
            manager
                .enable(&cli.target, cfg.defaults.clone(), cli.duration)
                .await
        }
    }
    .context("Failed to enable automation")?;
    tracing::info!(
        "Watching {} ({}), type 'exit' to quit",
        cli.target,
        cfg.app.name.as_deref().unwrap_or("respawn")
    );
    tracing::debug!("Initial status: {:?}", status.state);

    let signal = ShutdownSignal::new();
    signal.install_os_handlers();
    let reason = run_until_shutdown(
        signal,
        read_commands(Arc::clone(&manager), cli.target.clone()),
        Arc::clone(&manager),
        DEFAULT_DRAIN_TIMEOUT,
    )
    .await;
    tracing::info!("Exiting ({:?})", reason);

    printer.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line_commands() {
        assert_eq!(
            "hook stop".parse::<LineCommand>(),
            Ok(LineCommand::Hook(HookEvent::Stop))
        );
        assert_eq!(
            "  hook permission_prompt ".parse::<LineCommand>(),
            Ok(LineCommand::Hook(HookEvent::PermissionPrompt))
        );
        assert_eq!(
            "blocked waiting for credentials".parse::<LineCommand>(),
            Ok(LineCommand::Blocked("waiting for credentials".to_string()))
        );
        assert_eq!(
            "apply builtin:solo-work".parse::<LineCommand>(),
            Ok(LineCommand::Apply("builtin:solo-work".to_string()))
        );
        assert_eq!("exit".parse::<LineCommand>(), Ok(LineCommand::Exit));
        assert!("hook nap".parse::<LineCommand>().is_err());
        assert!("apply".parse::<LineCommand>().is_err());
        assert!("dance".parse::<LineCommand>().is_err());
    }
}
