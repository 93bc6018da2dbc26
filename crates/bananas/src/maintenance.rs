//! Background maintenance loops.
//!
//! The promotion loop moves due delayed jobs into their ready queues. It
//! needs no cross-instance coordination: promotion is idempotent, so two
//! instances racing on the same batch promote it once. The reaper loop is
//! optional and only runs when a threshold is configured.

use crate::executor::CancelToken;
use crate::queue::Queue;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Runs the ready-promotion loop until cancelled.
pub async fn run_promoter(queue: Arc<Queue>, interval: Duration, shutdown: CancelToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    debug!(interval_ms = interval.as_millis() as u64, "promotion loop started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                match queue.move_scheduled_to_ready().await {
                    Ok(0) => {}
                    Ok(promoted) => debug!(count = promoted, "promoted delayed jobs"),
                    Err(e) => warn!(error = %e, "promotion pass failed"),
                }
            }
        }
    }

    debug!("promotion loop stopped");
}

/// Runs the processing-list reaper until cancelled.
///
/// Requeues jobs whose worker died mid-processing. The threshold must
/// exceed the longest legitimate job or completed work will be executed
/// twice; at-least-once delivery makes that safe but not free.
pub async fn run_reaper(
    queue: Arc<Queue>,
    threshold: Duration,
    interval: Duration,
    shutdown: CancelToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    debug!(
        threshold_secs = threshold.as_secs(),
        "processing reaper started"
    );

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                match queue.reap_processing(threshold).await {
                    Ok(0) => {}
                    Ok(reaped) => warn!(count = reaped, "requeued stranded jobs"),
                    Err(e) => warn!(error = %e, "reaper pass failed"),
                }
            }
        }
    }

    debug!("processing reaper stopped");
}
