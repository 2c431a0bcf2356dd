//! Courier - delivery worker entry point

use anyhow::Result;
use courier_common::config::{Config, LoggingConfig};
use courier_core::{
    Dequeuer, Inspector, Maintenance, MessageInspector, Metrics, NetworkSenderFactory,
    QueueWorker, RspamdInspector, Stores,
};
use courier_storage::{DatabasePool, LocalStorage};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    init_logging(&config.logging);

    info!("Starting Courier delivery worker...");

    // Initialize database
    let db_pool = DatabasePool::new(&config.database).await?;
    info!("Database connection established");

    // Run migrations
    db_pool.migrate().await?;
    info!("Database migrations completed");

    // Initialize file storage
    let file_storage = Arc::new(LocalStorage::new(&config.storage)?);

    let stores = Stores::postgres(
        db_pool.clone(),
        file_storage,
        config.delivery.suppression_list_removal_days,
    );

    let mut inspectors: Vec<Arc<dyn Inspector>> = Vec::new();
    if config.inspection.rspamd.enabled {
        info!("Inspecting messages with rspamd at {}", config.inspection.rspamd.url);
        inspectors.push(Arc::new(RspamdInspector::new(
            config.inspection.rspamd.clone(),
        )));
    }

    let senders = Arc::new(NetworkSenderFactory::new(
        config.smtp_client.clone(),
        config.delivery.use_resent_sender_header,
        config.http_sender.clone(),
    ));

    let dequeuer = Arc::new(Dequeuer::new(
        stores.clone(),
        config.delivery.clone(),
        senders,
        MessageInspector::new(inspectors),
        Metrics::new()?,
        config.server.locker(),
    ));

    let shutdown = CancellationToken::new();

    // Start queue worker
    let worker_handle = {
        let worker = QueueWorker::new(dequeuer.clone(), config.worker.clone());
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            worker.run(shutdown).await;
        })
    };

    // Start maintenance
    let maintenance_handle = {
        let maintenance = Maintenance::new(stores, config.worker.clone());
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            maintenance.run(shutdown).await;
        })
    };

    info!("Courier started as {}", dequeuer.locker());

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    shutdown.cancel();
    let _ = worker_handle.await;
    let _ = maintenance_handle.await;

    info!("Courier shutdown complete");

    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},courier=debug", config.level)));

    let registry = tracing_subscriber::registry().with(filter);
    if config.format == "json" {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
