//! Rollup manager: persists closed monitoring buckets and evaluates alerts.

use crate::db::Store;
use crate::monitor::MonitoringService;

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Manager for rolling monitoring buckets into stored snapshots.
pub struct RollupManager {
    store: Arc<Store>,
    monitor: Arc<MonitoringService>,
    stop: Arc<Mutex<Option<tokio::sync::broadcast::Sender<()>>>>,
}

impl RollupManager {
    pub fn new(store: Arc<Store>, monitor: Arc<MonitoringService>) -> Self {
        Self {
            store,
            monitor,
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the rollup background task.
    pub fn start(&self) {
        let store = self.store.clone();
        let monitor = self.monitor.clone();
        let stop = self.stop.clone();

        tokio::spawn(async move {
            let (tx, _) = tokio::sync::broadcast::channel(1);
            {
                let mut stop_guard = stop.lock().await;
                *stop_guard = Some(tx.clone());
            }

            let mut rx = tx.subscribe();
            let mut interval = tokio::time::interval(Duration::from_secs(10));

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        process_rollup(&store, &monitor, Utc::now());
                    }
                }
            }
        });
    }

    pub async fn stop(&self) {
        let stop = self.stop.lock().await;
        if let Some(tx) = stop.as_ref() {
            let _ = tx.send(());
        }
    }
}

/// Persist closed buckets, then check alert thresholds.
pub fn process_rollup(store: &Store, monitor: &MonitoringService, now: DateTime<Utc>) {
    let snapshots = monitor.roll(now);
    if !snapshots.is_empty() {
        match store.add_monitoring_snapshots(&snapshots) {
            Ok(()) => tracing::debug!("RollupManager: Stored {} snapshots", snapshots.len()),
            Err(e) => tracing::error!("RollupManager: Failed to store snapshots: {}", e),
        }
    }

    let alerts = monitor.evaluate_alerts(now);
    if !alerts.is_empty() {
        tracing::info!("RollupManager: Raised {} alerts", alerts.len());
    }
}
