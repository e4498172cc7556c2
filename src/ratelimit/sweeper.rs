//! Periodic cleanup of expired counter rows.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::store::CounterStore;

/// Spawn the background task that bounds storage growth.
///
/// Every `interval` the task deletes rows whose window or block has ended.
/// This is best-effort housekeeping: a failed sweep is logged and retried at
/// the next tick, and never affects request serving.
pub fn spawn_purge_task(store: Arc<dyn CounterStore>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately; skip it to purge on the
        // steady cadence only.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match store.purge_expired(Utc::now().timestamp_millis()).await {
                Ok(removed) => debug!(removed, "Purged expired rate limit records"),
                Err(e) => warn!(error = %e, "Failed to purge expired rate limit records"),
            }
        }
    })
}
