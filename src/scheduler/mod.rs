//! Background loops: retry polling, monitoring rollup and retention.

mod retention;
mod rollup;

pub use retention::*;
pub use rollup::*;

use crate::db::Store;
use crate::delivery::Dispatcher;
use crate::monitor::MonitoringService;

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};

/// How often the durable retry queue is polled.
pub const RETRY_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Owns the background managers and the retry loop.
pub struct Scheduler {
    dispatcher: Dispatcher,
    stop: Arc<Mutex<Option<broadcast::Sender<()>>>>,
    rollup_manager: Arc<RollupManager>,
    retention_manager: Arc<RetentionManager>,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        dispatcher: Dispatcher,
        monitor: Arc<MonitoringService>,
        retention: chrono::Duration,
    ) -> Self {
        Self {
            rollup_manager: Arc::new(RollupManager::new(store.clone(), monitor)),
            retention_manager: Arc::new(RetentionManager::new(store, retention)),
            dispatcher,
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Recover lost retries, then start every background loop.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.dispatcher.recover(Utc::now())?;

        let (tx, _) = broadcast::channel(1);
        *self.stop.lock().await = Some(tx.clone());

        tracing::info!("Starting retry loop");
        tokio::spawn(run_retry_loop(self.dispatcher.clone(), tx.subscribe()));

        self.rollup_manager.start();
        self.retention_manager.start();
        Ok(())
    }

    pub async fn stop(&self) {
        if let Some(tx) = self.stop.lock().await.as_ref() {
            let _ = tx.send(());
        }
        self.rollup_manager.stop().await;
        self.retention_manager.stop().await;
    }
}

async fn run_retry_loop(dispatcher: Dispatcher, mut stop_rx: broadcast::Receiver<()>) {
    let mut interval = tokio::time::interval(RETRY_POLL_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = interval.tick() => {
                if let Err(e) = dispatcher.process_due_retries(Utc::now()).await {
                    tracing::error!("Scheduler: Failed to process retries: {}", e);
                }
            }
        }
    }
    tracing::info!("Retry loop stopped");
}
