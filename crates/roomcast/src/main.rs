//! Roomcast server binary.
//!
//! # Startup Flow
//!
//! 1. Initialize tracing
//! 2. Load configuration from environment
//! 3. Install the Prometheus metrics recorder
//! 4. Pick the session store (Redis when configured)
//! 5. Build the server and wait for a shutdown signal
//!
//! The transport engine binds to the returned server through
//! `Server::accept`; this binary only hosts the core.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use roomcast::config::Config;
use roomcast::observability::metrics::init_metrics_recorder;
use roomcast::store::{RedisSessionStore, SessionStore};
use roomcast::{Server, ServerOptions, SessionAwareAdapterBuilder};
use secrecy::ExposeSecret;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("Starting roomcast");

    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        server_id = %config.server_id,
        path = %config.path,
        connect_timeout_ms = config.connect_timeout.as_millis(),
        recovery = config.recovery.is_some(),
        cleanup_empty_child_namespaces = config.cleanup_empty_child_namespaces,
        redis = config.redis_url.is_some(),
        "Configuration loaded successfully"
    );

    let metrics_addr: SocketAddr = config
        .metrics_bind_address
        .parse()
        .with_context(|| format!("Invalid metrics bind address: {}", config.metrics_bind_address))?;
    init_metrics_recorder(metrics_addr).map_err(anyhow::Error::msg)?;
    info!(addr = %metrics_addr, "Prometheus metrics listener started");

    let mut options = ServerOptions::from_config(&config);
    if let (Some(recovery), Some(redis_url)) = (config.recovery, &config.redis_url) {
        info!("Connecting to Redis session store...");
        let store = RedisSessionStore::connect(redis_url.expose_secret())
            .await
            .context("Failed to connect to Redis")?;
        info!("Redis session store connected");
        let builder = SessionAwareAdapterBuilder::new(recovery).with_store_factory(move |nsp| {
            Arc::new(store.for_namespace(nsp)) as Arc<dyn SessionStore>
        });
        options = options.with_adapter(builder);
    }

    let server = Server::new(options);
    info!(server_id = %config.server_id, "Roomcast running - press Ctrl+C to shutdown");

    shutdown_signal().await?;
    info!("Shutdown signal received, closing server...");
    server.close().await;
    info!("Roomcast shutdown complete");
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "roomcast=debug".into());

    if std::env::var_os("ROOMCAST_LOG_JSON").is_some() {
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
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("Failed to install SIGTERM handler")?;
        tokio::select! {
            result = signal::ctrl_c() => result.context("Failed to install Ctrl+C handler")?,
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    signal::ctrl_c()
        .await
        .context("Failed to install Ctrl+C handler")?;

    Ok(())
}
