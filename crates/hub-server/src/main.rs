//! Selenium Hub control plane
//!
//! Brings the hub up at startup, serves the browser management API, and
//! removes every worker and the hub itself on shutdown.

use anyhow::{bail, Result};
use hub_lib::{health::HealthRegistry, SeleniumHub};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;
mod proxy;

const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting hub-server");

    let config = config::AppConfig::load()?;
    info!(
        deployment_mode = %config.hub.deployment_mode,
        port = config.server.port,
        "Control plane configured"
    );

    let hub = SeleniumHub::instance(Some(config.hub.clone())).await?;
    let logger = hub.logger().clone();

    let health_registry = HealthRegistry::new(hub.deployment_mode().to_string());
    api::register_components(&health_registry, &hub).await;

    let running = hub
        .ensure_hub_running(
            Some(config.server.startup_retries),
            Some(config.server.startup_wait()),
        )
        .await?;
    health_registry.record_hub(running).await;
    api::refresh_port_forward(&health_registry, &hub).await;
    if !running {
        logger.log_shutdown("Selenium Hub failed to start");
        bail!("Selenium Hub failed to start");
    }

    logger.log_startup(SERVER_VERSION, &hub.hub_url().await);

    if config.server.api_token.is_none() {
        warn!("No server.api_token configured; API routes are unauthenticated");
    }

    let state = Arc::new(api::AppState::new(
        hub.clone(),
        health_registry,
        config.server.api_token.clone(),
    )?);
    api::serve(config.server.port, state, shutdown_signal()).await?;

    logger.log_shutdown("signal received");
    hub.cleanup().await;
    SeleniumHub::release();
    info!("Shutdown complete");

    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
