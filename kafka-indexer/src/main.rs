use anyhow::{Context, Result};
use axum::{routing::get, Router};
use futures::future::ready;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use kafka_indexer::{
    config::Config,
    metrics::{serve, setup_metrics_routes},
    service::IndexerService,
    start_option,
};

pub async fn index() -> &'static str {
    "kafka indexer service"
}

fn start_server(config: &Config) -> Result<JoinHandle<()>> {
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(|| ready("ok")));

    let router = if config.export_prometheus {
        setup_metrics_routes(router)?
    } else {
        router
    };

    let bind = config.bind_address();

    Ok(tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("Failed to serve metrics on {bind}: {e:#}");
        }
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables")?;

    // Initialize tracing
    let log_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_level(true)
        .with_filter(EnvFilter::from_default_env())
        .boxed();

    tracing_subscriber::registry().with(log_layer).init();

    info!("Starting Kafka indexer service");
    info!("Configuration loaded: {:?}", config);

    // An unreadable override file, or a missing one in strict mode, aborts startup
    let resolved = start_option::resolve(
        config.start_option(),
        config.custom_start_options_path().as_deref(),
        config.missing_override_policy(),
    )
    .context("Failed to resolve consumer start options")?;

    if let Some(cause) = &resolved.fallback_cause {
        error!(
            "Consumer start option '{}' could not be applied, all partitions restart from committed offsets: {cause:#}",
            config.consumer_start_option
        );
    }

    let server_handle = start_server(&config)?;
    info!("Started metrics server on {}", config.bind_address());

    let service = IndexerService::with_log_sink(config, resolved.options)
        .context("Failed to create Kafka indexer service")?;

    // Run the service (this blocks until shutdown or a consumer halts)
    let result = service.run().await;

    server_handle.abort();

    result
}
