//! Keyhub Daemon - Control Surface Hub Server
//!
//! Runs the hub: supervises module processes, listens for module RPC on a
//! Unix socket and for satellite bridges on TCP, and keeps every attached
//! surface drawn.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults
//! keyhub-daemon
//!
//! # Custom config and store location
//! keyhub-daemon --config /etc/keyhub/keyhub.toml --data-dir /var/lib/keyhub
//!
//! # No satellite listener
//! keyhub-daemon --no-satellite
//!
//! # Daemonize (run in background)
//! keyhub-daemon --daemonize
//!
//! # Verbose logging
//! RUST_LOG=debug keyhub-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown
//! - `SIGHUP`: Rescan module directories and reconcile connections

mod server;

use std::fs;
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use keyhub_core::{default_config_path, load_config_from_path, ConfigOverrides, HubConfig};
use server::DaemonServer;

/// Keyhub Daemon - control surface hub
#[derive(Parser, Debug)]
#[command(name = "keyhub-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "KEYHUB_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Store snapshot directory
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Unix socket path for module connections
    #[arg(short = 's', long, value_name = "PATH")]
    rpc_socket: Option<PathBuf>,

    /// Directory of user-installed modules
    #[arg(long, value_name = "DIR")]
    modules_dir: Option<PathBuf>,

    /// Satellite listen address
    #[arg(long, value_name = "ADDR")]
    satellite_bind: Option<SocketAddr>,

    /// Do not run the satellite server
    #[arg(long)]
    no_satellite: bool,

    /// Run as daemon (fork to background)
    #[arg(short = 'd', long)]
    daemonize: bool,

    /// PID file path
    #[arg(long, env = "KEYHUB_PID_FILE", value_name = "PATH")]
    pid_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "KEYHUB_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(ref path) = self.rpc_socket {
            overrides = overrides.with_rpc_socket(path.clone());
        }
        if let Some(ref path) = self.data_dir {
            overrides = overrides.with_data_dir(path.clone());
        }
        if let Some(ref path) = self.modules_dir {
            overrides = overrides.with_modules_dir(path.clone());
        }
        if let Some(addr) = self.satellite_bind {
            overrides = overrides.with_satellite_bind(addr);
        }
        if self.no_satellite {
            overrides = overrides.with_satellite_enabled(false);
        }
        overrides
    }
}

/// Get the default PID file path
///
/// Uses XDG_RUNTIME_DIR if available, otherwise /tmp/keyhub-$UID/
fn default_pid_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir).join("keyhub").join("keyhub.pid")
    } else {
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/keyhub-{uid}/keyhub.pid"))
    }
}

/// Write PID file
fn write_pid_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create PID directory: {parent:?}"))?;
    }

    let pid = std::process::id();
    let mut file =
        fs::File::create(path).with_context(|| format!("Failed to create PID file: {path:?}"))?;
    writeln!(file, "{pid}")?;

    info!(pid = pid, path = ?path, "PID file created");
    Ok(())
}

/// Remove PID file
fn remove_pid_file(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            warn!(error = %e, path = ?path, "Failed to remove PID file");
        } else {
            info!(path = ?path, "PID file removed");
        }
    }
}

/// Refuse to start while another daemon holds the PID file
fn check_existing_daemon(pid_path: &Path) -> Result<()> {
    if !pid_path.exists() {
        return Ok(());
    }

    let pid_str = fs::read_to_string(pid_path)
        .with_context(|| format!("Failed to read PID file: {pid_path:?}"))?;

    let pid: i32 = pid_str
        .trim()
        .parse()
        .with_context(|| "Invalid PID in file")?;

    // Signal 0 only checks existence
    let result = unsafe { libc::kill(pid, 0) };
    if result == 0 {
        anyhow::bail!(
            "Another keyhub-daemon is already running (PID: {pid}). \
             Stop it first or remove {pid_path:?} if it's stale."
        );
    }

    warn!(pid = pid, "Removing stale PID file");
    fs::remove_file(pid_path)?;
    Ok(())
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("keyhub_daemon={level},keyhub_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

/// Daemonize the process (fork to background)
fn daemonize() -> Result<()> {
    use nix::unistd::{fork, setsid, ForkResult};

    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => std::process::exit(0),
        Ok(ForkResult::Child) => {}
        Err(e) => anyhow::bail!("First fork failed: {e}"),
    }

    setsid().context("setsid failed")?;

    // Second fork so the daemon can never reacquire a controlling terminal
    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => std::process::exit(0),
        Ok(ForkResult::Child) => {}
        Err(e) => anyhow::bail!("Second fork failed: {e}"),
    }

    Ok(())
}

fn load_config(args: &Args) -> Result<HubConfig> {
    let path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(path).context("Failed to load configuration")?;
    args.overrides().apply(&mut config);
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    info!("Keyhub daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args)?;
    let pid_path = args.pid_file.clone().unwrap_or_else(default_pid_path);

    info!(rpc_socket = ?config.rpc.socket_path, "Module socket");
    info!(pid_path = ?pid_path, "PID file path");
    if let Some(ref path) = config.config_file_path {
        info!(config_path = ?path, source = ?config.source(), "Config file");
    }

    check_existing_daemon(&pid_path)?;

    // Fork before the runtime exists; its worker threads would not survive
    if args.daemonize {
        info!("Daemonizing...");
        daemonize()?;
        info!("Daemonized, new PID: {}", std::process::id());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build async runtime")?;
    runtime.block_on(run(config, pid_path))
}

async fn run(config: HubConfig, pid_path: PathBuf) -> Result<()> {
    write_pid_file(&pid_path)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let rescan = Arc::new(AtomicBool::new(false));

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;

    let shutdown_flag = Arc::clone(&shutdown);
    let rescan_flag = Arc::clone(&rescan);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating shutdown");
                    shutdown_flag.store(true, Ordering::SeqCst);
                    break;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating shutdown");
                    shutdown_flag.store(true, Ordering::SeqCst);
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, rescanning modules");
                    rescan_flag.store(true, Ordering::SeqCst);
                }
            }
        }
    });

    let server = DaemonServer::new(config);
    let result = server.run(shutdown, rescan).await;

    info!("Shutting down...");
    remove_pid_file(&pid_path);

    match result {
        Ok(()) => {
            info!("Keyhub daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e)
        }
    }
}
