//! Uplink CLI - SFTP upload gateway
//!
//! Usage:
//!   uplink [serve]                    Run the gateway
//!   uplink sample-config              Print a sample configuration file

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use uplink_core::{GatewayConfig, LogFormat, PathGuard};
use uplink_daemon::supervisor::{listen_addr, load_host_key, ssh_config};
use uplink_daemon::{
    CommandDispatcher, ConnectionSupervisor, S3ObjectStore, SessionAuthenticator, StorageHandoff,
    StsIdentityVerifier, UploadRegistry,
};

#[derive(Parser)]
#[command(name = "uplink")]
#[command(about = "SFTP gateway that stores uploads in S3", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, global = true, env = "UPLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormatArg>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway (default)
    Serve,

    /// Print a sample configuration file
    SampleConfig,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormatArg {
    Json,
    Text,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Json => LogFormat::Json,
            LogFormatArg::Text => LogFormat::Text,
        }
    }
}

fn init_logging(format: LogFormat, verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(fmt::layer().json().with_target(false)).init(),
        LogFormat::Text => registry.with(fmt::layer().with_target(false)).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::SampleConfig) = cli.command {
        print!("{}", GatewayConfig::sample());
        return Ok(());
    }

    let config = GatewayConfig::load(cli.config.as_deref());
    let format = cli
        .log_format
        .map(LogFormat::from)
        .or_else(|| config.as_ref().ok().map(|c| c.log.format))
        .unwrap_or(LogFormat::Json);
    init_logging(format, cli.verbose);

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };

    run(config).await
}

async fn run(config: GatewayConfig) -> anyhow::Result<()> {
    info!(
        port = config.server.port,
        virtual_dir = %config.upload.virtual_dir,
        s3_bucket = %config.storage.bucket,
        s3_prefix = %config.storage.bucket_prefix,
        region = %config.storage.region,
        max_file_size = config.upload.max_file_size,
        max_connections = config.server.max_connections,
        "starting SFTP gateway"
    );

    let key = load_host_key(config.server.host_key_path.as_deref())?;
    let region = config.storage.region().map(str::to_string);

    let verifier = Arc::new(StsIdentityVerifier::new(region.clone()));
    let authenticator = Arc::new(
        SessionAuthenticator::new(verifier, config.auth.required_account_id.clone())
            .with_timeout(config.auth.verify_timeout()),
    );

    let store = Arc::new(S3ObjectStore::new(config.storage.bucket.clone(), region));
    let handoff = Arc::new(
        StorageHandoff::new(store, config.storage.prefix().map(str::to_string))
            .with_timeout(config.storage.handoff_timeout()),
    );

    let registry = Arc::new(UploadRegistry::new(config.upload.max_file_size));
    let dispatcher = Arc::new(CommandDispatcher::new(
        PathGuard::new(&config.upload.virtual_dir),
        registry,
        handoff,
    ));

    let supervisor = ConnectionSupervisor::new(
        &config.server,
        ssh_config(&config.server, key),
        authenticator,
        dispatcher,
    );

    let listener = ConnectionSupervisor::bind(listen_addr(&config.server))
        .await
        .context("failed to start listener")?;

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    supervisor.serve(listener, shutdown).await?;
    info!("SFTP gateway stopped");
    Ok(())
}

async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received interrupt, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }

    shutdown.cancel();
}
