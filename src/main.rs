//! Postback Relay
//!
//! Delivers affiliate conversions to external trackers as HTTP postbacks,
//! with anti-fraud gating, durable retries and delivery monitoring.

mod config;
mod db;
mod delivery;
mod monitor;
mod postback;
mod scheduler;
mod web;

use config::{import_profiles, ServerConfig};
use db::Store;
use delivery::Dispatcher;
use monitor::{Alert, MonitoringService};
use postback::TrackerRegistry;
use scheduler::Scheduler;
use web::Server;

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("postback_relay=info".parse()?))
        .init();

    let cfg = ServerConfig::load();
    tracing::info!("Starting postback relay on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);
    tracing::info!("Tracker credentials configured for {:?}", cfg.credentials.configured());

    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    if let Some(path) = &cfg.profiles_path {
        import_profiles(&store, path)?;
    }

    // Alerts end here; the external notifier reads them from the log.
    let (alert_tx, alert_rx) = mpsc::channel(256);
    tokio::spawn(forward_alerts(alert_rx));

    let monitor = Arc::new(MonitoringService::new(cfg.monitor_config(), alert_tx));
    let trackers = Arc::new(TrackerRegistry::new(cfg.credentials.clone()));
    let dispatcher = Dispatcher::new(
        store.clone(),
        trackers,
        monitor.clone(),
        cfg.dispatcher_config(),
    )?;

    let scheduler = Scheduler::new(
        store.clone(),
        dispatcher.clone(),
        monitor.clone(),
        chrono::Duration::days(cfg.log_retention_days),
    );
    scheduler.start().await?;

    let server = Server::new(cfg, store, dispatcher, monitor);
    let result = server.start().await;

    scheduler.stop().await;
    result
}

async fn forward_alerts(mut rx: mpsc::Receiver<Alert>) {
    while let Some(alert) = rx.recv().await {
        match serde_json::to_string(&alert) {
            Ok(payload) => tracing::warn!(alert = %payload, "Postback alert"),
            Err(e) => tracing::error!("Failed to encode alert: {}", e),
        }
    }
}
