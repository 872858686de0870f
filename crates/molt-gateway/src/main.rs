//! # molt-gateway
//!
//! Event gateway binary: loads settings, connects the WebSocket server to
//! the session backend, and serves until interrupted.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use molt_core::{LogFormat, init_subscriber};
use molt_server::shutdown::ShutdownOutcome;
use molt_server::{GatewayServer, ServerConfig};
use molt_settings::GatewaySettings;
use molt_stream::HttpEventSource;

/// MoltSlack event gateway.
#[derive(Parser, Debug)]
#[command(name = "molt-gateway", about = "Multiplexes chat event streams over WebSocket")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Base URL of the session backend (overrides settings).
    #[arg(long)]
    upstream: Option<String>,

    /// Settings file (default `~/.moltslack/gateway.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log level (overrides settings; `RUST_LOG` still wins).
    #[arg(long)]
    log_level: Option<String>,

    /// Log format: `compact` or `json`.
    #[arg(long)]
    log_format: Option<LogFormat>,
}

impl Cli {
    /// Apply command-line overrides on top of loaded settings.
    fn apply(&self, settings: &mut GatewaySettings) {
        if let Some(ref host) = self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(ref upstream) = self.upstream {
            settings.upstream.base_url.clone_from(upstream);
        }
        if let Some(ref level) = self.log_level {
            settings.logging.level.clone_from(level);
        }
        if let Some(format) = self.log_format {
            settings.logging.format = format;
        }
    }
}

fn load(cli: &Cli) -> Result<GatewaySettings> {
    let mut settings = match cli.settings {
        Some(ref path) => molt_settings::load_settings_from_path(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => molt_settings::load_settings().context("Failed to load settings")?,
    };
    cli.apply(&mut settings);
    settings.validate().context("Invalid settings")?;
    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load(&cli)?;
    init_subscriber(&settings.logging.level, settings.logging.format);

    let metrics_handle =
        molt_server::metrics::install_recorder().context("Failed to install metrics recorder")?;

    let source = HttpEventSource::new(
        &settings.upstream.base_url,
        Duration::from_millis(settings.upstream.connect_timeout_ms),
    )
    .context("Invalid upstream URL")?;
    tracing::info!(upstream = %source.base_url(), "session backend configured");

    let config = ServerConfig::from(&settings.server);
    let shutdown_timeout = config.shutdown_timeout();
    let server = GatewayServer::new(config, Arc::new(source), metrics_handle);

    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    tracing::info!("MoltSlack gateway listening on ws://{addr}/ws");

    wait_for_signal().await?;

    tracing::info!("Shutting down...");
    let outcome = server
        .shutdown()
        .graceful_shutdown(vec![handle], shutdown_timeout)
        .await;
    if outcome == ShutdownOutcome::TimedOut {
        tracing::warn!("shutdown timed out; remaining tasks aborted");
    }
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Resolve on Ctrl-C, or SIGTERM on Unix.
async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res.context("Failed to listen for ctrl-c")?,
            _ = terminate.recv() => tracing::info!("received SIGTERM"),
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for ctrl-c")
    }
}
