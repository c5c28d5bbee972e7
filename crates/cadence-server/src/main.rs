use std::path::Path;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use cadence_engine::config::EngineConfig;
use cadence_engine::scheduler::run_scheduler;
use cadence_engine::CadenceEngine;
use cadence_server::rest::create_router;
use cadence_server::state::AppState;
use cadence_storage::SqliteStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = EngineConfig::from_env();
    std::fs::create_dir_all(&config.data_dir)?;
    let store = Arc::new(SqliteStore::open(
        &Path::new(&config.data_dir).join("cadence.db"),
    )?);
    let engine = Arc::new(CadenceEngine::new(store.clone(), store, config));

    let (shutdown_tx, _) = broadcast::channel(1);
    let scheduler = tokio::spawn(run_scheduler(engine.clone(), shutdown_tx.subscribe()));

    let state = Arc::new(AppState::new(engine));
    let router = create_router(state);

    let addr = std::env::var("CADENCE_LISTEN_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".into());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "cadence server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            let _ = shutdown_tx.send(());
        })
        .await?;

    scheduler.abort();
    Ok(())
}
