//! # huddle
//!
//! Gateway binary: loads settings, installs telemetry and serves until Ctrl-C.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use huddle_server::{BackendConnector, WsConnector};
use huddle_settings::HuddleSettings;

/// Room signaling and backend relay gateway.
#[derive(Parser, Debug)]
#[command(name = "huddle", about = "Room signaling and backend relay gateway")]
struct Cli {
    /// Settings file (defaults to `~/.huddle/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// WebSocket URL of the backend service.
    #[arg(long)]
    backend_url: Option<String>,

    /// Log filter, e.g. `info` or `huddle_server=debug`.
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    /// Apply flags over the loaded settings (flags win).
    fn apply(&self, settings: &mut HuddleSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(url) = &self.backend_url {
            settings.backend.url.clone_from(url);
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if self.json_logs {
            settings.logging.json = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let settings_path = args
        .config
        .clone()
        .unwrap_or_else(huddle_settings::settings_path);
    let mut settings = huddle_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;
    args.apply(&mut settings);
    huddle_settings::loader::validate(&settings).context("Invalid settings")?;

    huddle_telemetry::init_logging(&settings.logging).context("Failed to initialize logging")?;
    let metrics = huddle_telemetry::install_recorder().context("Failed to install metrics recorder")?;

    tracing::info!(
        path = %settings_path.display(),
        port = settings.server.port,
        backend = %settings.backend.url,
        reap_empty_rooms = settings.rooms.reap_empty,
        "starting huddle gateway"
    );

    let connector: Arc<dyn BackendConnector> = Arc::new(WsConnector::new(settings.backend.url.clone()));
    let handle = huddle_server::start(&settings, connector, Some(metrics))
        .await
        .context("Failed to start server")?;

    tracing::info!(addr = %handle.addr(), "huddle gateway ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    if !handle.shutdown().await {
        tracing::warn!("shutdown drain timed out");
    }
    Ok(())
}
