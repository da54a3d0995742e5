//! hostlink daemon - WebSocket command bridge
//!
//! Serves automation clients over WebSocket and keeps their write requests
//! alive across host rebuilds.
//!
//! # Usage
//!
//! ```bash
//! # Serve in the foreground (default)
//! hostlinkd serve --project-root ./game --port 7070
//!
//! # Show an outstanding compilation-await record
//! hostlinkd status
//!
//! # Drop an outstanding compilation-await record
//! hostlinkd clear-pending
//! ```
//!
//! Signals: SIGTERM/SIGINT shut down, SIGHUP requests a host rebuild.

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use hostlink_core::config::ENV_CONFIG;
use hostlink_core::{mask_secret, BridgeConfig, ConfigError};
use hostlinkd::compilation::{CompilationRecord, FileStore};
use hostlinkd::{BridgeDeps, ConfigLoader, HostSignals, HostSupervisor};

/// hostlink daemon - command bridge for a rebuilding host
#[derive(Parser, Debug)]
#[command(name = "hostlinkd", version, about)]
struct Args {
    /// Configuration file (TOML). Falls back to $HOSTLINK_CONFIG.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the bridge
    Serve {
        /// Port to listen on (overrides configuration)
        #[arg(short, long)]
        port: Option<u16>,

        /// Project root that path arguments must stay inside
        #[arg(long)]
        project_root: Option<PathBuf>,
    },
    /// Show the outstanding compilation-await record, if any
    Status,
    /// Remove the outstanding compilation-await record
    ClearPending,
}

/// Command-line overrides re-applied on every configuration load.
#[derive(Debug, Clone, Default)]
struct Overrides {
    config_path: Option<PathBuf>,
    port: Option<u16>,
    project_root: Option<PathBuf>,
}

impl Overrides {
    fn load(&self) -> Result<BridgeConfig, ConfigError> {
        let path = self
            .config_path
            .clone()
            .or_else(|| std::env::var_os(ENV_CONFIG).map(PathBuf::from));

        let mut config = BridgeConfig::load(path.as_deref())?;
        config.apply_process_env()?;
        if let Some(port) = self.port {
            config.network.port = port;
        }
        if let Some(root) = &self.project_root {
            config.security.project_root = root.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let command = args.command.unwrap_or(Command::Serve {
        port: None,
        project_root: None,
    });

    match command {
        Command::Serve { port, project_root } => {
            let overrides = Overrides {
                config_path: args.config,
                port,
                project_root,
            };
            run_daemon(overrides)
        }
        Command::Status => {
            let config = load_for_maintenance(args.config)?;
            let store = FileStore::new(config.storage.compilation_store_path());
            match CompilationRecord::load(&store).context("Failed to read compilation record")? {
                Some(record) => {
                    let pending = record.pending_result.as_ref();
                    let summary = json!({
                        "store": store.path().display().to_string(),
                        "wasConnectedBeforeCompile": record.was_connected_before_compile,
                        "compilationStartTime": record.compilation_start_time.map(|t| t.to_rfc3339()),
                        "requestId": record.request_id(),
                        "command": pending.map(|p| p.command.as_str()),
                        "operation": pending.map(|p| p.operation.as_str()),
                        "hasResult": pending.is_some_and(|p| p.result.is_some()),
                    });
                    println!("{}", serde_json::to_string_pretty(&summary)?);
                    Ok(())
                }
                None => {
                    println!("No compilation await outstanding.");
                    process::exit(1);
                }
            }
        }
        Command::ClearPending => {
            let config = load_for_maintenance(args.config)?;
            let store = FileStore::new(config.storage.compilation_store_path());
            CompilationRecord::clear(&store).context("Failed to clear compilation record")?;
            println!("Cleared compilation record in {}", store.path().display());
            Ok(())
        }
    }
}

fn load_for_maintenance(config_path: Option<PathBuf>) -> Result<BridgeConfig> {
    let overrides = Overrides {
        config_path,
        ..Overrides::default()
    };
    overrides.load().context("Failed to load configuration")
}

#[tokio::main]
async fn run_daemon(overrides: Overrides) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("hostlinkd=info".parse()?)
                .add_directive("hostlink_core=info".parse()?)
                .add_directive("hostlink_protocol=info".parse()?),
        )
        .init();

    let config = overrides.load().context("Failed to load configuration")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        address = %config.network.bind_address(),
        project_root = %config.security.project_root.display(),
        token = %mask_secret(config.security.token.as_deref()),
        "hostlink daemon starting"
    );

    let host = HostSignals::new();
    let store_path = config.storage.compilation_store_path();
    ensure_parent(&store_path)?;
    let deps = BridgeDeps::new(host.clone(), Arc::new(FileStore::new(store_path)));

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    let signal_host = host.clone();
    tokio::spawn(async move {
        if let Err(e) = watch_signals(signal_host, signal_token.clone()).await {
            error!(error = %e, "Error waiting for signals");
            signal_token.cancel();
        }
    });

    let loader: ConfigLoader = Arc::new(move || overrides.load());
    let supervisor = HostSupervisor::new(config, deps, shutdown).with_reload(loader);

    if let Err(e) = supervisor.run().await {
        error!(error = %e, "Bridge error");
        return Err(e.into());
    }

    info!("hostlink daemon stopped");
    Ok(())
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create state directory {}", parent.display()))?;
    }
    Ok(())
}

/// Cancels `shutdown` on SIGTERM/SIGINT; turns SIGHUP into a rebuild request.
async fn watch_signals(host: HostSignals, shutdown: CancellationToken) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                    break;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP");
                    host.request_rebuild("SIGHUP");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = &host;
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    shutdown.cancel();
    Ok(())
}
