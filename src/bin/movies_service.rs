//! Marquee movies service - catalog backend and queue worker
//!
//! Owns the catalog. Serves the RPC surface the gateway reads through and
//! runs the consumer that applies queued creates and deletes.
//!
//! ## Configuration
//!
//! `config/movies.toml` (or `MOVIES_CONFIG`), overridden by environment:
//! - `RABBITMQ_URL`, `RABBITMQ_EXCHANGE`, `RABBITMQ_QUEUE`, routing keys
//! - `MOVIES_SERVICE_PORT`: RPC port (default: 50051)
//! - `SEED_PATH`: JSON file loaded into an empty catalog
//! - `MOVIES_WORKER_NAME`: consumer tag (default: hostname or UUID)
//! - `WORKER_MAX_REDELIVERIES`: enables the dead-letter queue
//! - `RUST_LOG`: log filter (default: "info")

use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use marquee::broker::Consumer;
use marquee::config::AppConfig;
use marquee::movies::seed::seed_if_empty;
use marquee::movies::{InMemoryMovieRepository, MovieRepository, MovieService};
use marquee::rpc::rpc_router;
use marquee::shutdown::ShutdownSignal;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = AppConfig::load().map_err(|e| {
        error!(error = %e, "Invalid configuration");
        e
    })?;

    let repo: Arc<dyn MovieRepository> = Arc::new(InMemoryMovieRepository::new());
    if let Some(path) = &config.service.seed_path {
        seed_if_empty(repo.as_ref(), path).await?;
    }
    let service = MovieService::new(repo);

    let shutdown = ShutdownSignal::new();
    tokio::spawn(shutdown.clone().listen_for_signals());

    let consumer = Consumer::new(&config, Arc::new(service.clone()));
    let consumer_state = consumer.state();

    // A consumer that cannot run takes the whole process down with it
    let worker_shutdown = shutdown.clone();
    let mut worker = tokio::spawn(async move {
        let result = consumer.start(worker_shutdown.clone()).await;
        if result.is_err() {
            worker_shutdown.trigger();
        }
        result
    });

    let app = rpc_router(service, consumer_state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.service.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Movies service listening on {}", addr);

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await?;

    match tokio::time::timeout(shutdown.timeout(), &mut worker).await {
        Ok(Ok(Ok(stats))) => {
            info!(
                processed = stats.processed,
                failed = stats.failed,
                "Movies service stopped"
            );
            Ok(())
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "Consumer failed");
            Err(e.into())
        }
        Ok(Err(e)) => {
            error!(error = %e, "Consumer task panicked");
            Err(e.into())
        }
        Err(_) => {
            warn!(
                timeout_secs = shutdown.timeout().as_secs(),
                "Consumer did not drain in time, aborting"
            );
            worker.abort();
            Ok(())
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
