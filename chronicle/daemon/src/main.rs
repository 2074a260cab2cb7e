//! Chronicle Daemon - Unix socket server for log queries and tool sessions
//!
//! Speaks newline-delimited JSON: one request per line, one response line or
//! a run of stream envelopes back.
//!
//! # Usage
//!
//! ```bash
//! # Run with defaults
//! chronicle-daemon
//!
//! # Custom socket and log root
//! chronicle-daemon --socket /tmp/chronicle.sock --root ~/logs
//!
//! # Debug logging
//! RUST_LOG=debug chronicle-daemon
//! ```
//!
//! # Environment Variables
//!
//! - `CHRONICLE_SOCKET`: Socket path
//! - `CHRONICLE_CONFIG`: Path to the TOML configuration file
//! - `CHRONICLE_ROOT`, `CHRONICLE_MAX_PROCESSES`, `CHRONICLE_TOOL_PROGRAM`
//!   and the other `CHRONICLE_*` engine settings (see `chronicle_core::config`)
//! - `RUST_LOG`: Log level (trace, debug, info, warn, error)

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use chronicle_core::{default_config_path, load_config_from_path, ConfigOverrides, Engine};

mod server;

use server::DaemonServer;

/// Chronicle Daemon - Unix socket server for conversation logs
#[derive(Parser, Debug)]
#[command(name = "chronicle-daemon")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the Unix socket
    #[arg(short, long, env = "CHRONICLE_SOCKET")]
    socket: Option<PathBuf>,

    /// Path to the TOML configuration file
    #[arg(short, long, env = "CHRONICLE_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding the log collections
    #[arg(short, long, value_name = "DIR")]
    root: Option<PathBuf>,

    /// Maximum number of concurrent tool processes
    #[arg(short = 'm', long)]
    max_processes: Option<usize>,

    /// Conversational tool executable
    #[arg(short, long, value_name = "PROGRAM")]
    tool: Option<String>,

    /// PID file path
    #[arg(long)]
    pid_file: Option<PathBuf>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

/// Runtime directory: `$XDG_RUNTIME_DIR/chronicle` or `/tmp/chronicle-$UID`
fn runtime_dir() -> PathBuf {
    match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) => PathBuf::from(dir).join("chronicle"),
        None => PathBuf::from(format!("/tmp/chronicle-{}", nix::unistd::getuid())),
    }
}

fn default_socket_path() -> PathBuf {
    runtime_dir().join("chronicle.sock")
}

fn default_pid_path() -> PathBuf {
    runtime_dir().join("chronicle.pid")
}

fn write_pid_file(path: &Path) -> Result<()> {
    use std::fs;
    use std::io::Write;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create PID directory: {parent:?}"))?;
    }

    let mut file =
        fs::File::create(path).with_context(|| format!("Failed to create PID file: {path:?}"))?;
    writeln!(file, "{}", std::process::id())?;
    Ok(())
}

fn remove_pid_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        warn!(path = ?path, error = %e, "Failed to remove PID file");
    }
}

/// Refuse to start when a live daemon owns the PID file; clear stale ones
fn check_existing_daemon(pid_path: &Path) -> Result<()> {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(contents) = std::fs::read_to_string(pid_path) else {
        return Ok(());
    };

    if let Ok(pid) = contents.trim().parse::<i32>() {
        if kill(Pid::from_raw(pid), None).is_ok() {
            anyhow::bail!("Daemon already running with PID {pid}");
        }
    }

    warn!(path = ?pid_path, "Removing stale PID file");
    std::fs::remove_file(pid_path)
        .with_context(|| format!("Failed to remove stale PID file: {pid_path:?}"))?;
    Ok(())
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "chronicle_daemon={level},chronicle_core={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

/// Cancel `token` on the first SIGTERM or SIGINT
fn install_signal_handlers(token: CancellationToken) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
            _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
        }
        token.cancel();
    });
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "Chronicle Daemon starting");

    let socket_path = args.socket.clone().unwrap_or_else(default_socket_path);
    let pid_path = args.pid_file.clone().unwrap_or_else(default_pid_path);

    check_existing_daemon(&pid_path)?;

    let mut overrides = ConfigOverrides::new();
    if let Some(root) = args.root {
        overrides = overrides.with_root(root);
    }
    if let Some(max) = args.max_processes {
        overrides = overrides.with_max_concurrent(max);
    }
    if let Some(tool) = args.tool {
        overrides = overrides.with_program(tool);
    }

    let config_path = args.config.or_else(default_config_path);
    let mut config =
        load_config_from_path(config_path).context("Failed to load configuration")?;
    overrides
        .apply(&mut config)
        .context("Invalid command line overrides")?;

    info!(
        socket = ?socket_path,
        root = ?config.root,
        max_processes = config.process.max_concurrent,
        tool = %config.process.program,
        source = %config.source(),
        "Configuration loaded"
    );

    let engine = Engine::open(&config)
        .await
        .context("Failed to open engine")?;

    write_pid_file(&pid_path)?;
    info!(path = ?pid_path, "PID file written");

    let shutdown = CancellationToken::new();
    install_signal_handlers(shutdown.clone())?;

    let server = DaemonServer::new(socket_path, engine);
    let result = server.run(shutdown).await;

    remove_pid_file(&pid_path);

    match &result {
        Ok(()) => info!("Chronicle Daemon stopped"),
        Err(e) => error!(error = %e, "Chronicle Daemon exited with error"),
    }
    result
}
