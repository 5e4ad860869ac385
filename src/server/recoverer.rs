//! Recoverer: requeues tasks whose lease expired

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::Inner;

pub(crate) const RECOVERER_INTERVAL: Duration = Duration::from_secs(60);

pub(crate) async fn run(inner: Arc<Inner>) {
    let mut shutdown = inner.shutdown_tx.subscribe();
    let mut interval = tokio::time::interval(RECOVERER_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!("recoverer started");

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }
        recover(&inner).await;
    }
    info!("recoverer stopped");
}

async fn recover(inner: &Arc<Inner>) {
    let now = Utc::now();
    for queue in inner.queue_names() {
        let expired = match inner.broker.list_lease_expired(&queue, now).await {
            Ok(expired) => expired,
            Err(err) => {
                warn!(queue = %queue, error = %err, "failed to list expired leases");
                continue;
            }
        };
        for msg in expired {
            // recovery does not consume a retry, but a task past its own
            // deadline is no longer worth running
            let result = if msg.deadline > 0 && msg.deadline <= now.timestamp() {
                inner.broker.archive(&msg, "deadline exceeded").await
            } else {
                inner.broker.requeue(&msg).await
            };
            match result {
                Ok(()) => info!(id = %msg.id, queue = %queue, "recovered task with expired lease"),
                Err(err) => {
                    // most likely another recoverer won the race
                    warn!(id = %msg.id, queue = %queue, error = %err, "failed to recover task");
                }
            }
        }
    }
}
