//! Reference worker process.
//!
//! Loads configuration from layered TOML files and `BANANAS_`-prefixed
//! environment variables, assembles the runtime for the configured worker
//! mode, and runs until SIGINT/SIGTERM. Exits 0 on clean shutdown and 1 on
//! configuration or store-initialization failure.
//!
//! Handlers are registered in [`handlers::install`]; deployments embed
//! their own job types there or use the library directly.

use anyhow::Context;
use bananas::{Bananas, BananasConfig};
use tokio::signal;
use tracing::{error, info};

mod handlers;

#[tokio::main]
async fn main() {
    init_logging();

    info!("starting bananas worker");
    info!("version: {}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run().await {
        error!("worker error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = load_config().context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;

    info!(mode = ?config.worker.mode, concurrency = config.worker.concurrency, "configuration loaded");

    bananas::metrics::register_metrics();

    let runtime = Bananas::connect(config)
        .await
        .context("failed to initialize store")?;

    handlers::install(runtime.handlers());
    handlers::install_schedules(runtime.schedules());

    runtime.start().context("failed to start runtime")?;

    shutdown_signal().await;
    info!("shutdown signal received");

    runtime.stop().await;
    info!("worker shutdown complete");
    Ok(())
}

/// Loads configuration from `bananas.toml` (if present), a file named by
/// `BANANAS_CONFIG` (if set), and `BANANAS_`-prefixed environment
/// variables, in increasing precedence.
fn load_config() -> anyhow::Result<BananasConfig> {
    // A .env file is a convenience, not a requirement.
    let _ = dotenvy::dotenv();

    let mut builder = config::Config::builder()
        .add_source(config::File::with_name("bananas").required(false));

    if let Ok(path) = std::env::var("BANANAS_CONFIG") {
        builder = builder.add_source(config::File::with_name(&path));
    }

    let settings = builder
        .add_source(
            config::Environment::with_prefix("BANANAS")
                .separator("__")
                .list_separator(",")
                .try_parsing(true)
                .with_list_parse_key("worker.priorities")
                .with_list_parse_key("worker.routing_keys")
                .with_list_parse_key("worker.job_types"),
        )
        .build()?;

    Ok(settings.try_deserialize()?)
}

fn init_logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,bananas=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("received terminate signal, initiating graceful shutdown");
        }
    }
}
