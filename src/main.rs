use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use optgrid::cli::{run_command, Cli, Commands};
use optgrid::config::Config;
use optgrid::engine::spawn_reapply_worker;
use optgrid::Engine;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(&cli.config)?;

    // Initialize logging
    let log_level = cli
        .log_level
        .as_ref()
        .unwrap_or(&config.logging.level)
        .clone();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level));

    if config.logging.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    if !matches!(cli.command, None | Some(Commands::Run)) {
        return run_command(&cli, &config).await;
    }

    tracing::info!("Starting optgrid v{}", env!("CARGO_PKG_VERSION"));

    for problem in config.validate() {
        tracing::warn!(problem = %problem, "Configuration problem");
    }

    // Initialize database
    let db = optgrid::db::init(&config.database).await?;
    optgrid::metrics::describe_metrics();

    let engine = Engine::new(&config, db.clone());
    let worker = spawn_reapply_worker(engine.applier().clone(), &config.clustering);
    if worker.is_none() {
        tracing::warn!("Background reapply is disabled, waiting for shutdown only");
    }

    shutdown_signal().await;

    if let Some(handle) = worker {
        handle.abort();
    }
    db.close().await;

    tracing::info!("Stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
