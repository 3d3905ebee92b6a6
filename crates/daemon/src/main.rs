//! The warden daemon: wires the components together and speaks the
//! prompt-channel protocol as JSON lines — inbound messages on stdin,
//! outbound messages on stdout.  Logs go to stderr so stdout stays a
//! clean message stream.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use warden_config::AppConfig;
use warden_container::{ContainerManager, DockerRuntime, ShellToolProvider};
use warden_llm::{HttpCompletionService, LlmDriver};
use warden_runtime::{ConversationManager, InboundMessage, OutboundMessage, PromptChannel};
use warden_state::StateStore;
use warden_tools::ToolRegistry;

#[derive(Debug, Parser)]
#[command(name = "warden", version, about = "Containerized-shell agent host")]
struct Cli {
    /// Path to the TOML config file.  Missing file = defaults.
    #[arg(long, default_value = "warden.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the agent (default).
    Start,
    /// Delete the persisted tool-state file.
    ResetState,
}

/// Writes outbound messages as JSON lines on stdout.
struct StdoutChannel;

#[async_trait]
impl PromptChannel for StdoutChannel {
    async fn send(&self, message: OutboundMessage) {
        match serde_json::to_string(&message) {
            Ok(line) => println!("{line}"),
            Err(err) => warn!(%err, "cannot serialize outbound message"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("load config from {}", cli.config.display()))?;

    match cli.command.unwrap_or(Commands::Start) {
        Commands::ResetState => {
            StateStore::new(config.state_file()).reset();
            Ok(())
        }
        Commands::Start => start(config).await,
    }
}

async fn start(config: AppConfig) -> Result<()> {
    let scratch_root = config.runtime_root.join("agent-working-directory");
    std::fs::create_dir_all(&config.runtime_root)
        .with_context(|| format!("create runtime root {}", config.runtime_root.display()))?;

    let store = Arc::new(StateStore::new(config.state_file()));
    let runtime = Arc::new(
        DockerRuntime::connect(config.container.clone())
            .context("connect to the container runtime")?,
    );
    let containers = Arc::new(ContainerManager::new(
        runtime,
        config.container.clone(),
        scratch_root.clone(),
    ));
    containers.start();

    let mut registry = ToolRegistry::new(store, scratch_root);
    registry
        .register(Arc::new(ShellToolProvider::new(
            containers.clone(),
            config.container.shell_timeout_seconds,
        )))
        .context("register the shell tool provider")?;

    let driver = Arc::new(LlmDriver::new(
        Arc::new(HttpCompletionService::new(config.model.api_base_url.clone())),
        config.model.clone(),
        config.backoff.clone(),
    ));

    let manager = Arc::new(ConversationManager::new(
        config,
        driver,
        Arc::new(registry),
        containers,
        Arc::new(StdoutChannel),
    ));

    info!("warden is up; send new_prompt messages on stdin");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        let message: InboundMessage = match serde_json::from_str(line) {
                            Ok(message) => message,
                            Err(err) => {
                                warn!(%err, "unparseable inbound line; dropping");
                                continue;
                            }
                        };
                        if !message.is_prompt() {
                            continue;
                        }
                        let manager = manager.clone();
                        tokio::spawn(async move {
                            manager
                                .on_prompt(&message.payload.conversation_id, &message.payload.prompt)
                                .await;
                        });
                    }
                    Ok(None) => {
                        info!("stdin closed; shutting down");
                        break;
                    }
                    Err(err) => {
                        warn!(%err, "stdin read failed; shutting down");
                        break;
                    }
                }
            }
            _ = shutdown_signal() => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    manager.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(_) => {
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
