use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info};
use transcribe_relay::{
    backend::{ScriptConfig, ScriptTranscriber},
    server::{router, spawn_stats_reporter, AppState, RelayStats},
    store::{spawn_sweeper, UploadStore},
};

#[derive(Parser)]
#[command(name = "transcribe-relay")]
#[command(about = "An HTTP relay that transcribes audio uploads via an external process")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "RELAY_BIND", default_value = "127.0.0.1:5001")]
    pub bind: SocketAddr,

    /// Path to the transcription script (validated at startup)
    #[arg(long, env = "RELAY_SCRIPT")]
    pub script: PathBuf,

    /// Interpreter used to run the script
    #[arg(long, env = "RELAY_COMMAND", default_value = "python3")]
    pub command: String,

    /// Working directory for the transcription process
    #[arg(long, env = "RELAY_WORKDIR")]
    pub workdir: Option<PathBuf>,

    /// Directory where uploads are staged
    #[arg(long, env = "RELAY_UPLOAD_DIR", default_value = "uploads")]
    pub upload_dir: PathBuf,

    /// Prebuilt client bundle to serve on non-API paths
    #[arg(long, env = "RELAY_STATIC_DIR")]
    pub static_dir: Option<PathBuf>,

    /// Transcription process time limit in seconds
    #[arg(long, env = "RELAY_TIMEOUT", default_value = "120")]
    pub transcribe_timeout: u64,

    /// Maximum accepted upload size in megabytes
    #[arg(long, env = "RELAY_MAX_UPLOAD_MB", default_value = "25")]
    pub max_upload_mb: usize,

    /// Keep staged uploads after responding instead of deleting them
    #[arg(long, env = "RELAY_KEEP_UPLOADS", default_value = "false")]
    pub keep_uploads: bool,

    /// Retention sweep interval in seconds
    #[arg(long, default_value = "300")]
    pub sweep_interval: u64,

    /// Age in seconds after which a staged upload is swept
    #[arg(long, default_value = "3600")]
    pub max_upload_age: u64,

    /// Stats reporting interval in seconds
    #[arg(long, default_value = "60")]
    pub stats_interval: u64,

    /// Log level
    #[arg(long, value_enum, default_value = "info")]
    pub log_level: LogLevel,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

/// Main relay service: owns the shared state and the background tasks
pub struct RelayService {
    args: Args,
    state: AppState,
    shutdown_tx: broadcast::Sender<()>,
}

impl RelayService {
    /// Build the service from CLI arguments, validating the backend before
    /// anything binds or spawns.
    pub fn new(args: Args) -> Result<Self> {
        let backend = ScriptTranscriber::new(ScriptConfig {
            command: args.command.clone(),
            script: args.script.clone(),
            working_dir: args.workdir.clone(),
            env_vars: Vec::new(),
            timeout: Duration::from_secs(args.transcribe_timeout),
        });
        backend
            .validate()
            .context("Transcription backend validation failed")?;

        let state = AppState {
            store: UploadStore::new(&args.upload_dir),
            backend: Arc::new(backend),
            stats: Arc::new(RelayStats::default()),
            static_dir: args.static_dir.clone(),
            keep_uploads: args.keep_uploads,
            max_upload_bytes: args.max_upload_mb * 1024 * 1024,
        };

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            args,
            state,
            shutdown_tx,
        })
    }

    /// Bind the listener, start the background tasks, and serve until a
    /// shutdown signal arrives.
    pub async fn start(&self) -> Result<()> {
        let sweeper_handle = spawn_sweeper(
            self.state.store.clone(),
            Duration::from_secs(self.args.sweep_interval),
            Duration::from_secs(self.args.max_upload_age),
            &self.shutdown_tx,
        );
        let stats_handle = spawn_stats_reporter(
            Arc::clone(&self.state.stats),
            Duration::from_secs(self.args.stats_interval),
            &self.shutdown_tx,
        );

        let listener = TcpListener::bind(self.args.bind)
            .await
            .with_context(|| format!("Failed to bind {}", self.args.bind))?;
        info!("Listening on {}", listener.local_addr()?);

        axum::serve(listener, router(self.state.clone()))
            .with_graceful_shutdown(wait_for_shutdown(self.shutdown_tx.subscribe()))
            .await
            .context("Server error")?;

        // Stop the background tasks once the listener has drained.
        let _ = self.shutdown_tx.send(());
        sweeper_handle.abort();
        stats_handle.abort();

        info!("Transcription relay stopped");
        Ok(())
    }

    /// Request a graceful stop.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Resolve when Ctrl+C, SIGTERM, or an internal shutdown request arrives.
async fn wait_for_shutdown(mut shutdown_rx: broadcast::Receiver<()>) {
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C signal");
        }
        _ = wait_for_term_signal() => {
            info!("Received TERM signal");
        }
        _ = shutdown_rx.recv() => {
            info!("Received internal shutdown signal");
        }
    }
}

/// Wait for TERM signal (Unix only)
#[cfg(unix)]
async fn wait_for_term_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    if let Ok(mut stream) = signal(SignalKind::terminate()) {
        stream.recv().await;
    }
}

#[cfg(not(unix))]
async fn wait_for_term_signal() {
    std::future::pending::<()>().await;
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level: tracing::Level = args.log_level.into();
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    info!("Starting Transcribe Relay v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration:");
    info!("  Bind address: {}", args.bind);
    info!("  Script: {}", args.script.display());
    info!("  Command: {}", args.command);
    info!("  Upload dir: {}", args.upload_dir.display());
    match args.static_dir {
        Some(ref dir) => info!("  Static dir: {}", dir.display()),
        None => info!("  Static dir: (disabled)"),
    }
    info!("  Process timeout: {}s", args.transcribe_timeout);
    info!("  Log level: {:?}", args.log_level);

    let service = RelayService::new(args).context("Failed to create transcription relay")?;

    if let Err(e) = service.start().await {
        error!("Service error: {:#}", e);
        return Err(e);
    }

    Ok(())
}
