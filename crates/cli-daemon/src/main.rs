//! CLI entry point for the re-encode daemon
//!
//! Parses command line arguments, sets up logging and runs the daemon until
//! Ctrl+C or SIGTERM.

use clap::Parser;
use reencode_daemon::{Config, Daemon};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Re-encode daemon - keeps a media library in HEVC
#[derive(Parser, Debug)]
#[command(name = "reencode-daemon")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml). A missing file means defaults.
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Library root to scan and watch, overriding `[library] root`
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Skip startup checks (ffmpeg, ffprobe, HEVC encoder). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(config = %args.config.display(), "Re-encode daemon starting");

    let mut config = match Config::load_or_default(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };
    if let Some(root) = args.root {
        config.library.root = Some(root);
    }

    let daemon_result = if args.skip_checks {
        warn!("Skipping startup checks (--skip-checks enabled)");
        Daemon::new_without_checks(config)
    } else {
        Daemon::new(config)
    };

    let daemon = match daemon_result {
        Ok(daemon) => daemon,
        Err(e) => {
            error!(error = %e, "Failed to initialize daemon");
            return ExitCode::FAILURE;
        }
    };

    info!(
        bind = %daemon.config().server.bind,
        concurrency_limit = daemon.dispatch().concurrency_limit(),
        "Daemon initialized"
    );

    if let Err(e) = daemon.run(shutdown_signal()).await {
        error!(error = %e, "Daemon error");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
