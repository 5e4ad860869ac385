//! Subscriber: cancellation events over pub/sub

use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::broker::keys;

use super::Inner;

const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);

pub(crate) async fn run(inner: Arc<Inner>) {
    let mut shutdown = inner.shutdown_tx.subscribe();
    info!("subscriber started");

    loop {
        if *shutdown.borrow() {
            break;
        }
        let mut pubsub = match inner.broker.pubsub().await {
            Ok(pubsub) => pubsub,
            Err(err) => {
                warn!(error = %err, "cancellation subscription failed, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(RECONNECT_BACKOFF) => continue,
                    _ = shutdown.changed() => break,
                }
            }
        };
        if let Err(err) = pubsub.subscribe(keys::CANCELLATION_CHANNEL).await {
            warn!(error = %err, "cancellation subscription failed, retrying");
            tokio::select! {
                _ = tokio::time::sleep(RECONNECT_BACKOFF) => continue,
                _ = shutdown.changed() => break,
            }
        }

        let mut messages = pubsub.on_message();
        loop {
            tokio::select! {
                message = messages.next() => match message {
                    Some(message) => {
                        let id: String = message.get_payload().unwrap_or_default();
                        if id.is_empty() {
                            continue;
                        }
                        if inner.registry.cancel(&id) {
                            info!(id = %id, "cancellation delivered to running handler");
                        } else {
                            // not ours; another server may hold the task
                            debug!(id = %id, "cancellation for unknown task ignored");
                        }
                    }
                    // connection dropped; fall through to reconnect
                    None => break,
                },
                _ = shutdown.changed() => {
                    info!("subscriber stopped");
                    return;
                }
            }
        }
        warn!("cancellation pub/sub connection lost, reconnecting");
    }
    info!("subscriber stopped");
}
