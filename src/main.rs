//! Mesh Adapter Service
//! Fronts the GitHub REST/GraphQL APIs for the Developer Mesh platform and
//! serves the webhook intake and metrics endpoints.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mesh_adapter::adapter::MeshAdapter;
use mesh_adapter::webhook::intake;
use mesh_adapter::{metrics, Config};

/// Mesh Adapter - resilient GitHub adapter for Developer Mesh
#[derive(Parser, Debug)]
#[command(name = "mesh-adapter")]
#[command(author = "Developer Mesh Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Resilient GitHub adapter and webhook intake for Developer Mesh")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, default_value = "false", global = true)]
    json_logs: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the adapter service (webhook intake + metrics)
    Serve,

    /// Print adapter health and configuration summary
    Status,

    /// Validate configuration and exit
    CheckConfig,
}

/// Sets up structured logging with tracing
fn setup_logging(log_level: &str, json_output: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if json_output {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

/// Handles graceful shutdown on SIGTERM/SIGINT
async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown...");
        }
    }

    let _ = shutdown_tx.send(());
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level, cli.json_logs);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Mesh Adapter"
    );

    let config = Config::load()?;
    config.validate()?;

    info!(
        api_base = %config.api_base_url,
        auth_mode = %config.auth_mode,
        max_concurrent = config.max_concurrent_requests,
        "Configuration loaded"
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    match cli.command {
        Commands::Serve => {
            serve(config, shutdown_tx).await?;
        }

        Commands::Status => {
            let adapter = MeshAdapter::new(Arc::new(config)).await?;
            println!("adapter: {} v{}", adapter.adapter_type(), adapter.version());
            println!("health:  {}", adapter.health());
            adapter.close().await;
        }

        Commands::CheckConfig => {
            println!("configuration ok");
        }
    }

    Ok(())
}

/// Runs the adapter with webhook intake and metrics servers
async fn serve(config: Config, shutdown_tx: broadcast::Sender<()>) -> Result<()> {
    let config = Arc::new(config);
    let adapter = Arc::new(MeshAdapter::new(config.clone()).await?);

    info!("Mesh Adapter initialized");

    if config.metrics_enabled {
        let addr: SocketAddr = ([0, 0, 0, 0], config.metrics_port).into();
        tokio::spawn(async move {
            if let Err(e) = metrics::start_metrics_server(addr).await {
                error!(error = %e, "Metrics server failed");
            }
        });
    }

    if config.has_webhook_secret() {
        let addr: SocketAddr = ([0, 0, 0, 0], config.webhook_port).into();
        let intake_adapter = adapter.clone();
        let mut intake_shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                res = intake::start_intake_server(addr, intake_adapter) => {
                    if let Err(e) = res {
                        error!(error = %e, "Webhook intake server failed");
                    }
                }
                _ = intake_shutdown.recv() => {
                    info!("Webhook intake server stopping");
                }
            }
        });
    }

    let shutdown_adapter = adapter.clone();
    let shutdown_handle = tokio::spawn(async move {
        shutdown_signal(shutdown_tx).await;

        info!("Shutting down adapter...");
        shutdown_adapter.close().await;
        info!("Adapter shutdown complete");
    });

    shutdown_handle.await?;
    Ok(())
}
