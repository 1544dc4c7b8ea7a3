//! Idle Key Sweeper
//!
//! Counters are created on first sight of a key and reset lazily, so nothing
//! removes them on its own. The sweeper drops keys untouched for longer than
//! any window or quota period they could still matter for.

use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::manager::AdmissionManager;
use crate::error::AdmissionError;
use crate::metrics;

/// Evict idle keys once; returns how many were removed
pub async fn sweep_once(manager: &AdmissionManager) -> Result<usize, AdmissionError> {
    // Rules may have been reloaded with a longer window since startup
    let largest_window = manager.registry().await.largest_window();
    let max_idle = manager.max_idle().max(largest_window);
    let now = manager.clock().monotonic();

    let evicted = manager.store().evict_idle(now, max_idle).await?;
    let remaining = manager.store().len().await?;
    let streaks = manager.window().evict_idle_streaks(now, max_idle);

    metrics::ADMISSION_EVICTED_KEYS_TOTAL.inc_by(evicted as u64);
    metrics::ADMISSION_TRACKED_KEYS.set(remaining as i64);
    debug!(evicted, remaining, streaks, "Swept idle admission counters");

    Ok(evicted)
}

/// Run [`sweep_once`] every `interval` until the task is aborted
pub fn spawn_sweeper(manager: AdmissionManager, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick completes immediately; nothing is idle yet
        ticker.tick().await;

        loop {
            ticker.tick().await;

            if let Err(e) = sweep_once(&manager).await {
                error!(error = %e, "Admission sweep failed");
            }
        }
    })
}
