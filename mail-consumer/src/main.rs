//! Mail Consumer - RabbitMQ consumer for appointment reminders and security codes.
//!
//! Consumes the reminder and security-code queues, renders each job into an
//! HTML email and hands it to the configured delivery transport.

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mail_consumer::{consumer, Config};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("worker_starting");

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "config_invalid");
            std::process::exit(1);
        }
    };

    info!(
        reminder_queue = %config.reminder_queue,
        security_queue = %config.security_queue,
        transport = config.transport.name(),
        max_delivery_attempts = config.max_delivery_attempts,
        reconnect_max_attempts = config.reconnect_max_attempts,
        health_port = ?config.health_port,
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        consumer::shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    if let Err(e) = consumer::run(config, shutdown_rx).await {
        error!(error = ?e, "worker_failed");
        std::process::exit(1);
    }

    Ok(())
}
