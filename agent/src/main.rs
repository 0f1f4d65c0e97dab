//! # Burrow Agent
//!
//! Runs on the NAT'd host: keeps one outbound tunnel to the gateway and
//! serves whatever arrives over it — proxied HTTP requests against the
//! local service, interactive terminals, and remote shell commands.
//!
//! ## Modules
//!
//! - [`config`]    — server/token/local target resolution (CLI > user > system)
//! - [`client`]    — connection state machine and frame dispatch
//! - [`backoff`]   — reconnect delay schedule
//! - [`forwarder`] — local HTTP replay
//! - [`pty`]       — interactive shell sessions
//! - [`executor`]  — remote shell commands
//! - [`metrics`]   — heartbeat host metrics

mod backoff;
mod client;
mod config;
mod error;
mod executor;
mod forwarder;
mod metrics;
mod pty;

use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{AgentConfig, Overrides};

#[derive(Parser, Debug)]
#[command(name = "burrow-agent", version, about = "Tunnel agent for the burrow gateway")]
struct Cli {
    /// Gateway connect URL, e.g. wss://gateway.example.com/ws
    #[arg(long)]
    server: Option<String>,

    /// Device auth token
    #[arg(long)]
    token: Option<String>,

    /// Host of the local service to expose
    #[arg(long)]
    local_host: Option<String>,

    /// Port of the local service to expose
    #[arg(long)]
    local_port: Option<u16>,

    /// Explicit config file (replaces the user/system lookup)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "burrow_agent=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = match AgentConfig::resolve(Overrides {
        server: cli.server,
        token: cli.token,
        local_host: cli.local_host,
        local_port: cli.local_port,
        config: cli.config,
    }) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("burrow-agent: {e}");
            std::process::exit(1);
        }
    };

    info!(
        local = %config.local_base(),
        "starting agent"
    );

    // Ctrl-C is the local stop: close the tunnel and do not reconnect.
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                shutdown.cancel();
            }
        });
    }

    client::run(config, shutdown).await;
}
