//! Janitor: reaps expired completed tasks and stale aggregation sets

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::Inner;

pub(crate) async fn run(inner: Arc<Inner>) {
    let mut shutdown = inner.shutdown_tx.subscribe();
    let mut interval = tokio::time::interval(inner.config.janitor_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!("janitor started");

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }
        for queue in inner.queue_names() {
            match inner
                .broker
                .delete_expired_completed(&queue, inner.config.janitor_batch_size)
                .await
            {
                Ok(0) => {}
                Ok(n) => debug!(queue = %queue, count = n, "deleted expired completed tasks"),
                Err(err) => warn!(queue = %queue, error = %err, "janitor sweep failed"),
            }
            if let Err(err) = inner.broker.reclaim_stale_aggregation_sets(&queue).await {
                warn!(queue = %queue, error = %err, "failed to reclaim stale aggregation sets");
            }
        }
    }
    info!("janitor stopped");
}
