use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ratewindow::config::RateWindowConfig;
use ratewindow::http::HttpServer;
use ratewindow::ratelimit::{LimiterGuard, Strategy};

/// Rate limited HTTP endpoint backed by a pluggable windowing strategy.
#[derive(Debug, Parser)]
#[command(name = "ratewindow", version, about)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "RATEWINDOW_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP listen address, overrides the configuration
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Rate limiting strategy, overrides the configuration
    #[arg(short, long, value_enum)]
    strategy: Option<Strategy>,

    /// Maximum actions per caller per window
    #[arg(long)]
    threshold: Option<u64>,

    /// Window length in milliseconds
    #[arg(long)]
    time_interval: Option<u64>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Starting ratewindow");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = RateWindowConfig::load(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.server.http_addr = listen;
    }
    if let Some(strategy) = cli.strategy {
        config.limiter.strategy = strategy;
    }
    if let Some(threshold) = cli.threshold {
        config.limiter.threshold = threshold;
    }
    if let Some(time_interval) = cli.time_interval {
        config.limiter.time_interval_ms = time_interval;
    }
    info!(
        http_addr = %config.server.http_addr,
        strategy = %config.limiter.strategy,
        threshold = config.limiter.threshold,
        time_interval_ms = config.limiter.time_interval_ms,
        "Configuration loaded"
    );

    // Connects to the backing store, if any, before serving traffic
    let guard = LimiterGuard::create(&config.limiter).await?;
    info!("Rate limiter initialized");

    let server = HttpServer::new(config.server.http_addr, guard.limiter());
    let served = server.serve_with_shutdown(shutdown_signal()).await;

    guard.shutdown().await;
    served?;

    info!("ratewindow stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
