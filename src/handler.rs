//! Handler trait and task-type dispatch

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, RwLock};

/// Marker error: archive the task immediately instead of retrying.
///
/// Return it from a handler (wrapped in `anyhow::Error`) when the failure is
/// known to be permanent:
///
/// ```ignore
/// return Err(SkipRetry.into());
/// ```
#[derive(Debug, thiserror::Error)]
#[error("skip retry for the task")]
pub struct SkipRetry;

/// Execution context handed to a handler alongside its task.
///
/// Carries the task metadata, a cancellation signal, and a slot for an
/// optional result written back to the store on success.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub id: String,
    pub task_type: String,
    pub payload: Vec<u8>,
    pub queue: String,
    pub retried: u32,
    pub max_retry: u32,
    /// Effective deadline for this attempt
    pub deadline: DateTime<Utc>,
    cancelled: watch::Receiver<bool>,
    result: Arc<Mutex<Option<Vec<u8>>>>,
}

impl TaskContext {
    pub(crate) fn new(
        msg: &crate::task::TaskMessage,
        deadline: DateTime<Utc>,
        cancelled: watch::Receiver<bool>,
    ) -> Self {
        Self {
            id: msg.id.clone(),
            task_type: msg.task_type.clone(),
            payload: msg.payload.clone(),
            queue: msg.queue.clone(),
            retried: msg.retried,
            max_retry: msg.max_retry,
            deadline,
            cancelled,
            result: Arc::new(Mutex::new(None)),
        }
    }

    /// True once the attempt has been cancelled (deadline, shutdown, or an
    /// explicit cancel event). Handlers should check at natural yield points.
    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    /// Resolve when the attempt is cancelled. Intended for `tokio::select!`
    /// against the handler's own work.
    pub async fn cancelled(&self) {
        let mut rx = self.cancelled.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Record result bytes to be persisted with the completed task.
    /// Only meaningful when the task was enqueued with a retention.
    pub fn set_result(&self, bytes: Vec<u8>) {
        *self.result.lock().expect("result slot poisoned") = Some(bytes);
    }

    pub(crate) fn take_result(&self) -> Option<Vec<u8>> {
        self.result.lock().expect("result slot poisoned").take()
    }
}

/// A task handler. One instance serves every task of the types it is
/// registered for; implementations must be safe to call concurrently.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn process_task(&self, ctx: &TaskContext) -> anyhow::Result<()>;
}

/// Registry dispatching task types to handlers.
///
/// Resolution tries an exact match first, then falls back to the longest
/// registered prefix, so `"email:"` can catch every email task while
/// `"email:deliver"` overrides it for that one type.
#[derive(Default)]
pub struct ServeMux {
    handlers: RwLock<HashMap<String, Arc<dyn Handler>>>,
}

impl ServeMux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a task type or type prefix
    pub async fn register<H>(&self, pattern: impl Into<String>, handler: H)
    where
        H: Handler + 'static,
    {
        let mut handlers = self.handlers.write().await;
        handlers.insert(pattern.into(), Arc::new(handler));
    }

    /// Find the handler for a task type
    pub async fn resolve(&self, task_type: &str) -> Option<Arc<dyn Handler>> {
        let handlers = self.handlers.read().await;

        if let Some(handler) = handlers.get(task_type) {
            return Some(handler.clone());
        }

        handlers
            .iter()
            .filter(|(pattern, _)| task_type.starts_with(pattern.as_str()))
            .max_by_key(|(pattern, _)| pattern.len())
            .map(|(_, handler)| handler.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskMessage;

    struct Named(&'static str);

    #[async_trait]
    impl Handler for Named {
        async fn process_task(&self, _ctx: &TaskContext) -> anyhow::Result<()> {
            Err(anyhow::anyhow!(self.0))
        }
    }

    async fn name_of(handler: Arc<dyn Handler>, ctx: &TaskContext) -> String {
        handler.process_task(ctx).await.unwrap_err().to_string()
    }

    fn message() -> TaskMessage {
        TaskMessage {
            id: "id".into(),
            task_type: "email:deliver".into(),
            payload: vec![],
            queue: "default".into(),
            max_retry: 1,
            retried: 0,
            timeout: 0,
            deadline: 0,
            unique_key: String::new(),
            group_key: String::new(),
            retention: 0,
            completed_at: 0,
            last_err: String::new(),
            last_failed_at: 0,
        }
    }

    fn context() -> TaskContext {
        let (_tx, rx) = watch::channel(false);
        TaskContext::new(&message(), Utc::now(), rx)
    }

    #[tokio::test]
    async fn exact_match_wins_over_prefix() {
        let mux = ServeMux::new();
        mux.register("email:", Named("prefix")).await;
        mux.register("email:deliver", Named("exact")).await;

        let handler = mux.resolve("email:deliver").await.unwrap();
        assert_eq!(name_of(handler, &context()).await, "exact");
    }

    #[tokio::test]
    async fn longest_prefix_wins() {
        let mux = ServeMux::new();
        mux.register("email:", Named("short")).await;
        mux.register("email:digest:", Named("long")).await;

        let handler = mux.resolve("email:digest:weekly").await.unwrap();
        assert_eq!(name_of(handler, &context()).await, "long");
        assert!(mux.resolve("image:resize").await.is_none());
    }

    #[tokio::test]
    async fn context_cancellation_is_observable() {
        let (tx, rx) = watch::channel(false);
        let ctx = TaskContext::new(&message(), Utc::now(), rx);
        assert!(!ctx.is_cancelled());
        tx.send(true).unwrap();
        ctx.cancelled().await;
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn skip_retry_is_detectable_through_anyhow_chains() {
        let err: anyhow::Error = SkipRetry.into();
        assert!(err.is::<SkipRetry>());
        let wrapped = err.context("charge failed");
        assert!(wrapped.chain().any(|cause| cause.is::<SkipRetry>()));
    }
}
