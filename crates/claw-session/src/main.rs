//! claw-session - identity-bound session client
//!
//! Connects to the chat endpoint for one identity, prints every session event
//! as a JSON line and forwards JSON lines from stdin.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use claw_session::logging::init_tracing;
use claw_session::{ConnectionEvent, ConnectionManager, Identity, LoggingConfig, SessionConfig};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// Time left for the socket task to send its close frame before exit.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

#[derive(Parser)]
#[command(name = "claw-session")]
#[command(about = "Identity-bound WebSocket session client")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect for an identity and relay messages until interrupted
    Connect {
        /// Identity to bind the session to
        #[arg(short, long, env = "CLAW_SESSION_IDENTITY")]
        identity: String,

        /// Path to config file
        #[arg(short, long, env = "CLAW_SESSION_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Print the session URL for an identity
    StatusUrl {
        /// Identity to derive the URL for
        #[arg(short, long)]
        identity: String,

        /// Path to config file
        #[arg(short, long, env = "CLAW_SESSION_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Generate a default config file
    InitConfig {
        /// Path to write config; stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Connect { identity, config } => {
            let config = load_config(config.as_deref())?;
            init_tracing(&config.logging)?;
            run_session(&config, &identity).await?;
        }

        Commands::StatusUrl { identity, config } => {
            let config = load_config(config.as_deref())?;
            let identity = Identity::new(identity)?;
            println!("{}", config.endpoint.url_for(&identity)?);
        }

        Commands::InitConfig { output } => {
            init_tracing(&LoggingConfig::default())?;
            init_config(output.as_deref())?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<SessionConfig> {
    match path {
        Some(path) => SessionConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(SessionConfig::default()),
    }
}

fn init_config(output: Option<&Path>) -> anyhow::Result<()> {
    let config = SessionConfig::default();
    match output {
        Some(path) => {
            config
                .save(path)
                .with_context(|| format!("writing config to {}", path.display()))?;
            info!(path = %path.display(), "wrote default config");
        }
        None => print!("{}", config.to_toml()?),
    }
    Ok(())
}

async fn run_session(config: &SessionConfig, identity: &str) -> anyhow::Result<()> {
    let identity = Identity::new(identity)?;
    let manager = ConnectionManager::with_websocket(config);

    manager
        .handlers()
        .add(Arc::new(|event: &ConnectionEvent| -> anyhow::Result<()> {
            println!("{}", event.to_json());
            Ok(())
        }));

    info!(identity = %identity, url = %config.endpoint.url_for(&identity)?, "starting session");
    manager.connect(identity.as_str());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("waiting for ctrl-c")?;
                info!("interrupt received");
                break;
            }
            line = lines.next_line(), if stdin_open => match line.context("reading stdin")? {
                Some(line) => forward_line(&manager, &line),
                None => {
                    info!("stdin closed, waiting for ctrl-c");
                    stdin_open = false;
                }
            },
        }
    }

    manager.logout();
    tokio::time::sleep(SHUTDOWN_GRACE).await;
    Ok(())
}

fn forward_line(manager: &ConnectionManager, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    match serde_json::from_str::<Value>(line) {
        Ok(message) => {
            if !manager.send_message(&message) {
                warn!(state = %manager.state(), "message not sent");
            }
        }
        Err(e) => warn!(error = %e, "stdin line is not valid JSON, skipping"),
    }
}
