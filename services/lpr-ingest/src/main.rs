use anyhow::{Context, Result};
use lpr_ingest::broker::Subscriber;
use lpr_ingest::config::ConsumerConfig;
use lpr_ingest::{
    start_api_server, AmqpConnector, AppState, BrokerRetryQueue, Config, ConnectionManager,
    ConsumerSettings, CreateRecordHandler, IngestionService, PgRecordStore, QueueConsumer,
    QueueSpec, RegulatorClient, RetryHandler, RetryScheduler, S3BlobStore,
};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(service = %config.service.name, "Starting LPR ingest service");

    init_metrics(config.service.metrics_port)?;

    let store = Arc::new(
        PgRecordStore::new(&config.database)
            .await
            .context("Failed to initialize record store")?,
    );

    if config.database.run_migrations {
        store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let blobs = Arc::new(
        S3BlobStore::new(&config.s3)
            .await
            .context("Failed to initialize blob store")?,
    );

    let regulator = Arc::new(
        RegulatorClient::new(config.regulator.clone()).context("Failed to build regulator client")?,
    );

    let shutdown = CancellationToken::new();

    let broker = ConnectionManager::new(
        Arc::new(AmqpConnector::new(config.broker.url.clone())),
        config.broker.clone(),
    );
    broker
        .connect()
        .await
        .context("Failed to connect to broker")?;

    let retry_queue = Arc::new(BrokerRetryQueue::new(
        broker.clone(),
        config.broker.retry_exchange.clone(),
        config.consumer.retry_routing_key.clone(),
    ));

    let service = Arc::new(IngestionService::new(
        store.clone(),
        blobs,
        regulator,
        retry_queue,
    ));
    let scheduler = Arc::new(RetryScheduler::new(
        service.clone(),
        config.consumer.defer_delay(),
        config.regulator.local_offset(),
    ));

    let primary = QueueConsumer::new(
        QueueSpec {
            name: config.consumer.primary_queue.clone(),
            exchange: config.broker.exchange.clone(),
            binding_key: config.consumer.primary_binding.clone(),
            message_ttl: None,
        },
        consumer_settings(&config.consumer),
        shutdown.clone(),
    );
    primary.register_handler(
        config.consumer.primary_binding.clone(),
        Arc::new(CreateRecordHandler::new(service)),
    );

    let retry = QueueConsumer::new(
        QueueSpec {
            name: config.consumer.retry_queue.clone(),
            exchange: config.broker.retry_exchange.clone(),
            binding_key: config.consumer.retry_binding.clone(),
            message_ttl: Some(config.consumer.retry_ttl()),
        },
        consumer_settings(&config.consumer),
        shutdown.clone(),
    );
    retry.register_handler(
        config.consumer.retry_binding.clone(),
        Arc::new(RetryHandler::new(scheduler)),
    );

    broker.register(primary.clone() as Arc<dyn Subscriber>);
    broker.register(retry.clone() as Arc<dyn Subscriber>);
    broker
        .setup_subscribers()
        .await
        .context("Failed to set up consumers")?;

    let mut workers = primary.run_workers();
    workers.extend(retry.run_workers());
    let supervisor = broker.spawn_supervisor(shutdown.clone());

    let api_state = AppState {
        broker: broker.clone(),
        store,
    };
    let api_config = config.api.clone();
    let api_shutdown = shutdown.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config, api_shutdown).await {
            error!(error = %e, "API server error");
        }
    });

    info!(
        workers = workers.len(),
        primary_queue = %config.consumer.primary_queue,
        retry_queue = %config.consumer.retry_queue,
        "LPR ingest service started"
    );

    shutdown_signal().await;

    info!("Shutting down LPR ingest service");
    shutdown.cancel();

    // workers finish the message in hand before exiting
    for worker in workers {
        if let Err(e) = worker.await {
            warn!(error = %e, "Worker task ended abnormally");
        }
    }
    if let Err(e) = supervisor.await {
        warn!(error = %e, "Broker supervisor ended abnormally");
    }
    if let Err(e) = api_handle.await {
        warn!(error = %e, "API server task ended abnormally");
    }

    info!("LPR ingest service stopped");

    Ok(())
}

fn consumer_settings(config: &ConsumerConfig) -> ConsumerSettings {
    ConsumerSettings {
        workers: config.workers,
        buffer_depth: config.buffer_depth,
        handler_timeout: config.handler_timeout(),
    }
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C signal"),
        _ = terminate => info!("Received SIGTERM signal"),
    }
}
