//! Forwarder: promotes due scheduled and retry tasks to pending

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::Inner;

pub(crate) async fn run(inner: Arc<Inner>) {
    let mut shutdown = inner.shutdown_tx.subscribe();
    let mut interval = tokio::time::interval(inner.config.delayed_task_check_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!("forwarder started");

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }
        for queue in inner.queue_names() {
            match inner.broker.forward(&queue).await {
                Ok(0) => {}
                Ok(n) => debug!(queue = %queue, count = n, "promoted delayed tasks"),
                Err(err) => warn!(queue = %queue, error = %err, "forward pass failed"),
            }
        }
    }
    info!("forwarder stopped");
}
