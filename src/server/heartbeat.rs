//! Heartbeat: liveness records and lease upkeep

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::broker::ServerInfo;

use super::Inner;

pub(crate) const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

pub(crate) async fn run(inner: Arc<Inner>) {
    let host = hostname();
    let pid = std::process::id();
    let mut shutdown = inner.shutdown_tx.subscribe();
    let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!("heartbeat started");

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }
        beat(&inner, &host, pid).await;
    }

    // marker for a prompt roster update instead of waiting out the TTL
    if let Err(err) = inner
        .broker
        .clear_server_state(&host, pid, &inner.server_id)
        .await
    {
        warn!(error = %err, "failed to clear server state at shutdown");
    }
    info!("heartbeat stopped");
}

async fn beat(inner: &Arc<Inner>, host: &str, pid: u32) {
    let now = Utc::now();

    // a lease that lapsed before we could extend it belongs to whichever
    // recoverer finds it first; cancel our copy of the work
    for id in inner.registry.lease_lost(now) {
        warn!(id = %id, "lease expired under a running handler, cancelling it");
        inner.registry.cancel(&id);
    }

    let workers = inner.registry.snapshot();
    let info = ServerInfo {
        host: host.to_string(),
        pid,
        server_id: inner.server_id.clone(),
        concurrency: inner.config.concurrency,
        queues: inner.config.queues.clone(),
        strict_priority: inner.config.strict_priority,
        status: "active".to_string(),
        started_at: inner.started_at,
        active_workers: workers.len(),
    };
    if let Err(err) = inner
        .broker
        .write_server_state(&info, &workers, HEARTBEAT_INTERVAL * 2)
        .await
    {
        warn!(error = %err, "failed to write server state");
    }

    let new_expiry = now
        + chrono::Duration::from_std(inner.config.lease_duration)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
    for (queue, ids) in inner.registry.ids_by_queue() {
        match inner.broker.extend_lease(&queue, &ids, new_expiry).await {
            Ok(()) => inner.registry.update_lease(&queue, &ids, new_expiry),
            Err(err) => warn!(queue = %queue, error = %err, "failed to extend leases"),
        }
    }
}
