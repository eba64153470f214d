//! Marquee gateway - public REST API
//!
//! Serves catalog reads by calling the movies service and turns creates and
//! deletes into envelopes on the RabbitMQ exchange.
//!
//! ## Configuration
//!
//! `config/movies.toml` (or `MOVIES_CONFIG`), overridden by environment:
//! - `RABBITMQ_URL`, `RABBITMQ_EXCHANGE`, `RABBITMQ_EXCHANGE_TYPE`
//! - `RABBITMQ_ROUTING_KEY_CREATED`, `RABBITMQ_ROUTING_KEY_DELETED`
//! - `MOVIES_SERVICE_URL`, `GATEWAY_PORT`
//! - `RUST_LOG`: log filter (default: "info")

use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use marquee::config::AppConfig;
use marquee::gateway::{self, AppState};
use marquee::rpc::MovieServiceClient;
use marquee::shutdown::ShutdownSignal;
use marquee::Publisher;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = AppConfig::load().map_err(|e| {
        error!(error = %e, "Invalid configuration");
        e
    })?;

    let shutdown = ShutdownSignal::new();
    tokio::spawn(shutdown.clone().listen_for_signals());

    // Fails after the broker retry budget is spent
    let publisher = Arc::new(Publisher::connect(&config.broker).await?);

    let movies = MovieServiceClient::new(
        &config.gateway.movies_service_url,
        config.gateway.rpc_timeout(),
    )?;
    info!(url = %movies.base_url(), "Movies service client ready");

    let app = gateway::router(AppState::new(publisher.clone(), Arc::new(movies)));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.gateway.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Gateway listening on {}", addr);

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await?;

    publisher.close().await;
    info!("Gateway stopped");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
