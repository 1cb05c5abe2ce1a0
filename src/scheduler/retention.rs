//! Retention manager for cleaning up old data.

use crate::db::Store;

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Deletes delivery log rows, snapshots and cancel tombstones past retention.
pub struct RetentionManager {
    store: Arc<Store>,
    retention: ChronoDuration,
    stop: Arc<Mutex<Option<tokio::sync::broadcast::Sender<()>>>>,
}

impl RetentionManager {
    pub fn new(store: Arc<Store>, retention: ChronoDuration) -> Self {
        Self {
            store,
            retention,
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the retention manager background task.
    pub fn start(&self) {
        let store = self.store.clone();
        let retention = self.retention;
        let stop = self.stop.clone();

        tokio::spawn(async move {
            let (tx, _) = tokio::sync::broadcast::channel(1);
            {
                let mut stop_guard = stop.lock().await;
                *stop_guard = Some(tx.clone());
            }

            let mut rx = tx.subscribe();
            let mut interval = tokio::time::interval(Duration::from_secs(60));

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        process_retention(&store, retention);
                    }
                }
            }
        });
    }

    /// Stop the retention manager.
    pub async fn stop(&self) {
        let stop = self.stop.lock().await;
        if let Some(tx) = stop.as_ref() {
            let _ = tx.send(());
        }
    }
}

/// One retention pass. Returns the number of rows removed.
pub fn process_retention(store: &Store, retention: ChronoDuration) -> usize {
    let cutoff = Utc::now() - retention;
    let mut removed = 0;

    match store.delete_attempts_before(cutoff) {
        Ok(n) => removed += n,
        Err(e) => tracing::error!("RetentionManager: Failed to delete delivery attempts: {}", e),
    }
    match store.delete_snapshots_before(cutoff) {
        Ok(n) => removed += n,
        Err(e) => tracing::error!("RetentionManager: Failed to delete snapshots: {}", e),
    }
    match store.delete_cancelled_retries_before(cutoff) {
        Ok(n) => removed += n,
        Err(e) => tracing::error!("RetentionManager: Failed to delete cancelled retries: {}", e),
    }

    if removed > 0 {
        tracing::debug!("RetentionManager: Removed {} rows older than {}", removed, cutoff);
    }
    removed
}
