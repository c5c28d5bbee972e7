//! Periodic tick loop driving recurring-instance generation.
//!
//! The engine itself never schedules anything; this loop just invokes the
//! rollforward sweep on a fixed interval. Correctness does not depend on
//! the interval as long as it is at most the shortest recurrence
//! granularity (daily).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;

use crate::engine::CadenceEngine;

/// Run the recurrence sweep until a shutdown signal is received.
pub async fn run_scheduler(engine: Arc<CadenceEngine>, mut shutdown_rx: broadcast::Receiver<()>) {
    let interval = Duration::from_secs(engine.config.recurrence.tick_interval_secs.max(1));
    tracing::info!(
        tick_secs = interval.as_secs(),
        lookahead_days = engine.config.recurrence.lookahead_days,
        "recurrence scheduler started"
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                tracing::info!("recurrence scheduler shutting down");
                break;
            }
            _ = tokio::time::sleep(interval) => {
                match engine.rollforward_recurring_tasks(Utc::now()).await {
                    Ok(stats) => {
                        tracing::debug!(
                            scanned = stats.scanned_templates,
                            spawned = stats.spawned_instances,
                            exhausted = stats.exhausted_templates,
                            errors = stats.errors,
                            "recurrence sweep complete"
                        );
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "recurrence sweep failed");
                    }
                }
            }
        }
    }
}
