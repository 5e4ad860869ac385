//! Syncer: retries settle operations that could not reach the store

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::error::Result;
use crate::task::TaskMessage;

use super::Inner;

/// A settle transition that failed transiently and awaits re-dispatch
#[derive(Debug, Clone)]
pub(crate) enum SettleOp {
    Done(TaskMessage),
    MarkComplete(TaskMessage),
    Retry {
        msg: TaskMessage,
        retry_at: DateTime<Utc>,
        err: String,
        is_failure: bool,
    },
    Archive {
        msg: TaskMessage,
        err: String,
    },
}

impl SettleOp {
    pub(crate) fn task_id(&self) -> &str {
        match self {
            SettleOp::Done(msg)
            | SettleOp::MarkComplete(msg)
            | SettleOp::Retry { msg, .. }
            | SettleOp::Archive { msg, .. } => &msg.id,
        }
    }

    pub(crate) async fn execute(&self, broker: &Broker) -> Result<()> {
        match self {
            SettleOp::Done(msg) => broker.done(msg).await,
            SettleOp::MarkComplete(msg) => broker.mark_complete(msg).await,
            SettleOp::Retry {
                msg,
                retry_at,
                err,
                is_failure,
            } => broker.retry(msg, *retry_at, err, *is_failure).await,
            SettleOp::Archive { msg, err } => broker.archive(msg, err).await,
        }
    }
}

/// One queued settle retry; dropped (and logged) past its deadline, after
/// which the recoverer picks the task up via its expired lease
#[derive(Debug)]
pub(crate) struct SyncRequest {
    pub(crate) op: SettleOp,
    pub(crate) deadline: DateTime<Utc>,
}

/// Delay before the n-th re-dispatch of a failed settle
pub(crate) fn backoff(attempt: u32) -> Duration {
    let millis = 500u64.saturating_mul(1 << attempt.min(6));
    Duration::from_millis(millis.min(10_000))
}

pub(crate) async fn run(inner: Arc<Inner>, mut rx: mpsc::Receiver<SyncRequest>) {
    let mut shutdown = inner.shutdown_tx.subscribe();
    info!("syncer started");
    loop {
        tokio::select! {
            request = rx.recv() => match request {
                Some(request) => process(&inner, request).await,
                None => break,
            },
            _ = shutdown.changed() => break,
        }
    }
    // final pass: give each queued op one last chance before exiting
    while let Ok(request) = rx.try_recv() {
        if let Err(err) = request.op.execute(&inner.broker).await {
            warn!(
                id = %request.op.task_id(),
                error = %err,
                "dropping settle operation at shutdown"
            );
        }
    }
    info!("syncer stopped");
}

async fn process(inner: &Arc<Inner>, request: SyncRequest) {
    let mut attempt = 0u32;
    loop {
        if Utc::now() > request.deadline {
            warn!(
                id = %request.op.task_id(),
                "settle operation expired, dropping; recoverer takes over"
            );
            return;
        }
        match request.op.execute(&inner.broker).await {
            Ok(()) => {
                debug!(id = %request.op.task_id(), "settle operation replayed");
                return;
            }
            Err(err) if err.is_transient() => {
                tokio::time::sleep(backoff(attempt)).await;
                attempt += 1;
            }
            Err(err) => {
                warn!(
                    id = %request.op.task_id(),
                    error = %err,
                    "settle operation failed permanently, dropping"
                );
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        assert_eq!(backoff(0), Duration::from_millis(500));
        assert_eq!(backoff(1), Duration::from_secs(1));
        assert_eq!(backoff(2), Duration::from_secs(2));
        assert_eq!(backoff(5), Duration::from_secs(10));
        assert_eq!(backoff(12), Duration::from_secs(10));
    }
}
