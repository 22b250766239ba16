//! # tether-agent
//!
//! `tether` binary: hosts the hub (or attaches to the one named by
//! `TETHER_IPC_ADDR`), optionally announces a project and waits for others,
//! then runs until Ctrl-C.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tether_core::FactKey;
use tether_core::logging::init_subscriber;
use tether_server::IpcContext;
use tether_settings::{TetherSettings, load_settings_from_path, settings_path};
use tracing::info;

/// Tether IPC hub.
#[derive(Parser, Debug)]
#[command(name = "tether", about = "Tether IPC hub")]
struct Cli {
    /// Host to bind (`*` for every interface).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (defaults to `~/.tether/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Announce this project as ready once connected.
    #[arg(long)]
    project: Option<String>,

    /// Wait until these projects are announced.
    #[arg(long, num_args = 1..)]
    wait: Vec<String>,

    /// Log level (overrides settings; `RUST_LOG` still wins).
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    /// Load settings and layer the command line on top. Watch mode is
    /// always on for the binary.
    fn resolve_settings(&self) -> Result<TetherSettings> {
        let path = self.settings.clone().unwrap_or_else(settings_path);
        let mut settings = load_settings_from_path(&path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?;

        settings.ipc.watch = true;
        if let Some(host) = &self.host {
            settings.ipc.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.ipc.port = port;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let settings = args.resolve_settings()?;
    init_subscriber(&settings.logging.level);

    let ctx = IpcContext::new(settings);
    let address = ctx.start().await.context("Failed to start IPC")?;
    println!("{address}");
    info!(address, host = ctx.is_host(), "tether ready");

    if let Some(name) = &args.project {
        let _ = ctx.register_project(FactKey::new(), name);
        info!(project = %name, "project announced");
    }

    if !args.wait.is_empty() {
        tokio::select! {
            () = ctx.wait_for_projects(args.wait.iter().cloned()) => {
                info!(projects = ?args.wait, "projects ready");
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                info!("Shutting down...");
                ctx.shutdown().await;
                return Ok(());
            }
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down...");
    ctx.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}
