mod config;
mod hash;
mod monitor;
mod mdns;
mod api;

use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use mdns_observer::{Observer, Transport};
use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("mdns_observerd=info,mdns_observer=info"))
        )
        .init();

    tracing::info!("Starting mdns-observerd");

    // Load config
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/mdns-observer/observerd.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Loaded config from {}", config_path);

    // One socket shared by the observer and the query sender
    let transport = Transport::new(config.transport.clone());
    let observer = Arc::new(Observer::new(&transport, config.observer.clone()));
    let events = monitor::subscribe(&observer, &config.watch)?;

    let initial_hash = hash::compute_hash(&[]);
    let (hash_tx, hash_rx) = watch::channel(initial_hash);

    observer.start();
    tracing::info!(
        "Observing {} on {}",
        transport.config().group,
        transport.config().interface
    );

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Spawn event monitor task
    let monitor_cancel = cancel.clone();
    let monitor_observer = observer.clone();
    let monitor_handle = tokio::spawn(async move {
        if let Err(e) = monitor::run(monitor_observer, events, hash_tx, monitor_cancel).await {
            tracing::error!("Event monitor error: {}", e);
        }
    });

    // Spawn query task
    let query_types = mdns::query::query_types(&config.watch, &config.query.service_types);
    let query_cancel = cancel.clone();
    let query_config = config.query.clone();
    let query_transport = transport.open();
    let query_handle = tokio::spawn(async move {
        if let Err(e) = mdns::query::run(query_transport, query_types, query_config, query_cancel).await {
            tracing::error!("Query task error: {}", e);
        }
    });

    // Build API router
    let listen = config.api.listen.clone();
    let app_state = api::routes::AppState {
        observer: observer.clone(),
        hash_rx,
        config: Arc::new(config),
    };
    let app = api::routes::router(app_state);

    // Bind HTTP server
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("Failed to bind to {}", listen))?;

    tracing::info!("API listening on {}", listen);

    // Run server with graceful shutdown
    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    // Remove events still reach the monitor before it is cancelled
    observer.stop(true).await;

    // Trigger cancellation
    cancel.cancel();

    // Wait for all tasks to complete
    let _ = tokio::join!(monitor_handle, query_handle, server_handle);

    tracing::info!("Shutdown complete");
    Ok(())
}
