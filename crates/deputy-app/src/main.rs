//! Deputy application binary: wires storage, the action engine, and the
//! HTTP API together.

mod cli;

use std::sync::Arc;

use clap::Parser;

use deputy_action::{DeliveryRegistry, DryRunDelivery, Engine};
use deputy_api::auth::load_or_generate_token;
use deputy_api::{start_server, AppState};
use deputy_core::config::DeputyConfig;
use deputy_storage::Database;

use cli::{expand_home, CliArgs};

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for ctrl-c");
        return;
    }
    tracing::info!("Shutdown requested");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Config, with CLI and env overrides applied on top.
    let config_file = args.resolve_config_path();
    let mut config = DeputyConfig::load_or_default(&config_file);
    if let Some(dir) = args.resolve_data_dir() {
        config.general.data_dir = dir;
    }
    if let Some(level) = args.resolve_log_level() {
        config.general.log_level = level;
    }
    config.api.port = args.resolve_port(config.api.port);

    // Tracing. RUST_LOG wins over the configured level.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.general.log_level)),
        )
        .init();

    tracing::info!("Starting Deputy v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(path = %config_file.display(), "Configuration loaded");

    // Storage.
    let data_dir = expand_home(&config.general.data_dir);
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        tracing::error!(path = %data_dir.display(), error = %e, "Failed to create data directory");
        return Err(e.into());
    }
    let db_path = data_dir.join("deputy.db");
    let db = Arc::new(Database::new(&db_path)?);
    tracing::info!(path = %db_path.display(), "SQLite database opened");

    // Engine. Provider clients are external; until one is registered,
    // every action type goes to the dry-run client.
    let registry = DeliveryRegistry::new().with_fallback(Arc::new(DryRunDelivery));
    let api_config = config.api.clone();
    let engine = Arc::new(Engine::new(db, config, registry)?);
    let recovered = engine.start()?;
    tracing::info!(recovered, "Action engine started");

    // === API server ===

    let token = load_or_generate_token(&data_dir.join("api_token"));
    let state = AppState::new(Arc::clone(&engine), token);

    let served = start_server(&api_config, state, shutdown_signal()).await;

    engine.shutdown().await;
    tracing::info!("Deputy stopped");

    served?;
    Ok(())
}
