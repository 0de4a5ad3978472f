use color_eyre::eyre::{self, WrapErr};
use dockscale_common::ContainerEngine;
use dockscale_controller::{Controller, ServiceRegistry};
use dockscale_engine::DockerEngine;
use dockscale_server::{create_app, AppState, ServerConfig, DEFAULT_LOG_FILTER};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let config = ServerConfig::from_env()?;
    info!(?config, "Starting dockscale");

    let registry = ServiceRegistry::load_from_file(&config.manifest, &config.reserved_service)
        .await
        .wrap_err("loading service registry")?;

    let engine = DockerEngine::connect(config.engine_config())
        .wrap_err("connecting to the Docker daemon")?;
    // The daemon may come up after us; requests report ENGINE_UNAVAILABLE until it does.
    if let Err(e) = engine.ping().await {
        warn!(error = %e, "Docker daemon not reachable at start-up");
    }

    let controller = Controller::new(Arc::new(engine), registry, config.controller_config());
    let app = create_app(AppState::new(controller));

    let listener = TcpListener::bind(config.bind_address()).await?;
    info!("dockscale listening on http://{}", config.bind_address());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("dockscale stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
