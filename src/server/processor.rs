//! Processor: dequeue, run the handler, settle the outcome

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit};
use tracing::{debug, error, info, warn};

use crate::broker::WorkerInfo;
use crate::error::Error;
use crate::handler::{ServeMux, SkipRetry, TaskContext};
use crate::task::TaskMessage;

use super::syncer::{SettleOp, SyncRequest};
use super::Inner;

/// Sleep between polls when every queue is empty; a small jitter keeps idle
/// servers from polling in lockstep
const IDLE_BACKOFF: Duration = Duration::from_secs(1);

/// Default retry schedule: roughly n^4 + 15 seconds with up to
/// `30 * (n + 1)` seconds of jitter, so early retries come quickly and
/// later ones back off hard.
pub fn default_retry_delay(n: u32, _err: &anyhow::Error, _msg: &TaskMessage) -> Duration {
    let base = (n as u64).pow(4) + 15;
    let jitter = rand::thread_rng().gen_range(0..30 * (n as u64 + 1));
    Duration::from_secs(base + jitter)
}

struct ActiveTask {
    cancel: watch::Sender<bool>,
    queue: String,
    task_type: String,
    started_at: DateTime<Utc>,
    deadline: DateTime<Utc>,
    lease_expiry: DateTime<Utc>,
}

/// In-flight task registry shared with the heartbeat and subscriber.
///
/// The mutex guards only map insert/remove/clone operations; it is never
/// held across a store call.
pub(crate) struct ActiveRegistry {
    tasks: Mutex<HashMap<String, ActiveTask>>,
}

impl ActiveRegistry {
    pub(crate) fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
        }
    }

    fn insert(
        &self,
        msg: &TaskMessage,
        cancel: watch::Sender<bool>,
        deadline: DateTime<Utc>,
        lease_expiry: DateTime<Utc>,
    ) {
        let task = ActiveTask {
            cancel,
            queue: msg.queue.clone(),
            task_type: msg.task_type.clone(),
            started_at: Utc::now(),
            deadline,
            lease_expiry,
        };
        self.tasks
            .lock()
            .expect("active registry poisoned")
            .insert(msg.id.clone(), task);
    }

    fn remove(&self, id: &str) {
        self.tasks
            .lock()
            .expect("active registry poisoned")
            .remove(id);
    }

    /// Fire the cancellation of one task. Returns false for unknown ids.
    pub(crate) fn cancel(&self, id: &str) -> bool {
        let tasks = self.tasks.lock().expect("active registry poisoned");
        match tasks.get(id) {
            Some(task) => {
                let _ = task.cancel.send(true);
                true
            }
            None => false,
        }
    }

    /// Fire every cancellation (server shutdown). Returns how many fired.
    pub(crate) fn cancel_all(&self) -> usize {
        let tasks = self.tasks.lock().expect("active registry poisoned");
        for task in tasks.values() {
            let _ = task.cancel.send(true);
        }
        tasks.len()
    }

    /// Snapshot for the heartbeat's worker records
    pub(crate) fn snapshot(&self) -> Vec<WorkerInfo> {
        let tasks = self.tasks.lock().expect("active registry poisoned");
        tasks
            .iter()
            .map(|(id, task)| WorkerInfo {
                task_id: id.clone(),
                task_type: task.task_type.clone(),
                queue: task.queue.clone(),
                started_at: task.started_at,
                deadline: task.deadline,
            })
            .collect()
    }

    /// In-flight ids grouped by queue, for lease extension
    pub(crate) fn ids_by_queue(&self) -> HashMap<String, Vec<String>> {
        let tasks = self.tasks.lock().expect("active registry poisoned");
        let mut map: HashMap<String, Vec<String>> = HashMap::new();
        for (id, task) in tasks.iter() {
            map.entry(task.queue.clone()).or_default().push(id.clone());
        }
        map
    }

    /// Record the new expiry after a successful lease extension
    pub(crate) fn update_lease(&self, queue: &str, ids: &[String], expiry: DateTime<Utc>) {
        let mut tasks = self.tasks.lock().expect("active registry poisoned");
        for id in ids {
            if let Some(task) = tasks.get_mut(id) {
                if task.queue == queue {
                    task.lease_expiry = expiry;
                }
            }
        }
    }

    /// Ids whose lease lapsed before it could be extended; their tasks now
    /// belong to whichever recoverer finds them first
    pub(crate) fn lease_lost(&self, now: DateTime<Utc>) -> Vec<String> {
        let tasks = self.tasks.lock().expect("active registry poisoned");
        tasks
            .iter()
            .filter(|(_, task)| task.lease_expiry <= now)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

/// Compute the queue polling order for one dequeue pass.
///
/// Strict priority sorts descending and shuffles ties; weighted mode samples
/// queues without replacement with probability proportional to weight, so
/// every queue gets a share of attention proportional to its weight.
fn queue_order(queues: &HashMap<String, u32>, strict: bool) -> Vec<String> {
    let mut rng = rand::thread_rng();
    let mut entries: Vec<(&String, u32)> = queues.iter().map(|(name, &p)| (name, p)).collect();

    if strict {
        entries.shuffle(&mut rng);
        // stable sort keeps the shuffled order within equal priorities
        entries.sort_by(|a, b| b.1.cmp(&a.1));
        return entries.into_iter().map(|(name, _)| name.clone()).collect();
    }

    let mut order = Vec::with_capacity(entries.len());
    while !entries.is_empty() {
        let total: u64 = entries.iter().map(|(_, weight)| *weight as u64).sum();
        let mut pick = rng.gen_range(0..total);
        let mut index = entries.len() - 1;
        for (i, (_, weight)) in entries.iter().enumerate() {
            if pick < *weight as u64 {
                index = i;
                break;
            }
            pick -= *weight as u64;
        }
        order.push(entries.remove(index).0.clone());
    }
    order
}

/// The control loop: acquire a slot, dequeue, hand off to a worker
pub(crate) async fn run(inner: Arc<Inner>, mux: Arc<ServeMux>) {
    let mut quit = inner.quit_tx.subscribe();
    info!("processor started");
    loop {
        if *quit.borrow() {
            break;
        }
        let permit = tokio::select! {
            permit = inner.semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = quit.changed() => continue,
        };
        if *quit.borrow() {
            drop(permit);
            break;
        }

        let order = queue_order(&inner.config.queues, inner.config.strict_priority);
        match inner.broker.dequeue(&order, inner.config.lease_duration).await {
            Ok(Some((msg, lease_expiry))) => {
                spawn_worker(inner.clone(), mux.clone(), msg, lease_expiry, permit);
            }
            Ok(None) => {
                drop(permit);
                let jitter = rand::thread_rng().gen_range(0..300);
                let backoff = IDLE_BACKOFF + Duration::from_millis(jitter);
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = quit.changed() => {}
                }
            }
            Err(err) => {
                drop(permit);
                warn!(error = %err, "dequeue failed");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    _ = quit.changed() => {}
                }
            }
        }
    }
    info!("processor stopped");
}

fn spawn_worker(
    inner: Arc<Inner>,
    mux: Arc<ServeMux>,
    msg: TaskMessage,
    lease_expiry: DateTime<Utc>,
    permit: OwnedSemaphorePermit,
) {
    tokio::spawn(async move {
        // the permit is the worker slot; settling releases it
        let _permit = permit;
        let deadline = msg.attempt_deadline(Utc::now());
        let (cancel_tx, cancel_rx) = watch::channel(false);
        inner
            .registry
            .insert(&msg, cancel_tx, deadline, lease_expiry);

        let ctx = TaskContext::new(&msg, deadline, cancel_rx.clone());
        let outcome = execute(&inner, &mux, &msg, &ctx, deadline, cancel_rx).await;
        inner.registry.remove(&msg.id);
        settle(&inner, &msg, &ctx, outcome).await;
    });
}

/// Run the handler bounded by the attempt deadline and the cancellation
/// signal. Handler panics surface as errors, never crash the server.
async fn execute(
    inner: &Arc<Inner>,
    mux: &Arc<ServeMux>,
    msg: &TaskMessage,
    ctx: &TaskContext,
    deadline: DateTime<Utc>,
    mut cancel_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let handler = match mux.resolve(&msg.task_type).await {
        Some(handler) => handler,
        None => {
            return Err(anyhow::anyhow!(
                "no handler registered for task type {:?}",
                msg.task_type
            ))
        }
    };

    let handler_ctx = ctx.clone();
    let mut join =
        tokio::spawn(async move { handler.process_task(&handler_ctx).await });

    let until_deadline = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    tokio::select! {
        result = &mut join => match result {
            Ok(outcome) => outcome,
            Err(err) if err.is_panic() => Err(anyhow::anyhow!("panic: {}", panic_message(err))),
            Err(_) => Err(anyhow::anyhow!("task canceled")),
        },
        _ = tokio::time::sleep(until_deadline) => {
            inner.registry.cancel(&msg.id);
            join.abort();
            Err(anyhow::anyhow!("deadline exceeded"))
        }
        _ = cancelled(&mut cancel_rx) => {
            join.abort();
            Err(anyhow::anyhow!("task canceled"))
        }
    }
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            // sender gone; treat as never-cancelled
            std::future::pending::<()>().await;
        }
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Decide and apply the settle transition for one finished attempt
async fn settle(inner: &Arc<Inner>, msg: &TaskMessage, ctx: &TaskContext, outcome: anyhow::Result<()>) {
    let op = match outcome {
        Ok(()) => {
            debug!(id = %msg.id, task_type = %msg.task_type, "task succeeded");
            if msg.retention > 0 {
                if let Some(result) = ctx.take_result() {
                    if let Err(err) = inner.broker.write_result(&msg.queue, &msg.id, &result).await
                    {
                        warn!(id = %msg.id, error = %err, "failed to persist task result");
                    }
                }
                SettleOp::MarkComplete(msg.clone())
            } else {
                SettleOp::Done(msg.clone())
            }
        }
        Err(err) => {
            let is_failure = (inner.config.is_failure)(&err);
            let skip_retry = err.chain().any(|cause| cause.is::<SkipRetry>());
            if skip_retry || (is_failure && msg.retried >= msg.max_retry) {
                warn!(
                    id = %msg.id,
                    task_type = %msg.task_type,
                    retried = msg.retried,
                    error = %err,
                    "archiving failed task"
                );
                SettleOp::Archive {
                    msg: msg.clone(),
                    err: err.to_string(),
                }
            } else {
                let attempt = msg.retried + 1;
                let delay = (inner.config.retry_delay)(attempt, &err, msg);
                warn!(
                    id = %msg.id,
                    task_type = %msg.task_type,
                    retried = msg.retried,
                    retry_in = ?delay,
                    error = %err,
                    "task failed, scheduling retry"
                );
                SettleOp::Retry {
                    msg: msg.clone(),
                    retry_at: Utc::now()
                        + chrono::Duration::from_std(delay).unwrap_or_else(|_| {
                            chrono::Duration::seconds(delay.as_secs() as i64)
                        }),
                    err: err.to_string(),
                    is_failure,
                }
            }
        }
    };

    match op.execute(&inner.broker).await {
        Ok(()) => {}
        Err(Error::LeaseExpired { id }) => {
            warn!(id = %id, "lease no longer owned, dropping settle; recoverer takes over");
        }
        Err(err) if err.is_transient() => {
            warn!(id = %msg.id, error = %err, "settle failed transiently, handing to syncer");
            let request = SyncRequest {
                op,
                deadline: Utc::now()
                    + chrono::Duration::from_std(inner.config.lease_duration)
                        .unwrap_or_else(|_| chrono::Duration::seconds(30)),
            };
            if inner.sync_tx.send(request).await.is_err() {
                error!(id = %msg.id, "syncer unavailable, settle dropped");
            }
        }
        Err(err) => {
            error!(id = %msg.id, error = %err, "settle failed permanently");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queues() -> HashMap<String, u32> {
        HashMap::from([
            ("critical".to_string(), 6),
            ("default".to_string(), 3),
            ("low".to_string(), 1),
        ])
    }

    #[test]
    fn strict_order_sorts_by_priority() {
        for _ in 0..32 {
            let order = queue_order(&queues(), true);
            assert_eq!(order, vec!["critical", "default", "low"]);
        }
    }

    #[test]
    fn strict_order_shuffles_ties() {
        let queues = HashMap::from([
            ("a".to_string(), 2),
            ("b".to_string(), 2),
            ("top".to_string(), 5),
        ]);
        let mut seen_ab = false;
        let mut seen_ba = false;
        for _ in 0..256 {
            let order = queue_order(&queues, true);
            assert_eq!(order[0], "top");
            match (order[1].as_str(), order[2].as_str()) {
                ("a", "b") => seen_ab = true,
                ("b", "a") => seen_ba = true,
                other => panic!("unexpected tie order: {other:?}"),
            }
        }
        assert!(seen_ab && seen_ba, "ties were never shuffled");
    }

    #[test]
    fn weighted_order_is_a_permutation() {
        let queues = queues();
        for _ in 0..64 {
            let mut order = queue_order(&queues, false);
            assert_eq!(order.len(), queues.len());
            order.sort();
            assert_eq!(order, vec!["critical", "default", "low"]);
        }
    }

    #[test]
    fn weighted_order_favors_heavier_queues() {
        let queues = HashMap::from([("heavy".to_string(), 9), ("light".to_string(), 1)]);
        let heavy_first = (0..1000)
            .filter(|_| queue_order(&queues, false)[0] == "heavy")
            .count();
        // expectation is 900; anything above 750 is decisively weighted
        assert!(heavy_first > 750, "heavy first only {heavy_first}/1000");
    }

    #[test]
    fn default_retry_delay_grows_and_stays_bounded() {
        let err = anyhow::anyhow!("boom");
        let msg = crate::task::TaskMessage {
            id: "x".into(),
            task_type: "t".into(),
            payload: vec![],
            queue: "default".into(),
            max_retry: 5,
            retried: 0,
            timeout: 0,
            deadline: 0,
            unique_key: String::new(),
            group_key: String::new(),
            retention: 0,
            completed_at: 0,
            last_err: String::new(),
            last_failed_at: 0,
        };
        for n in 1..=8u32 {
            let delay = default_retry_delay(n, &err, &msg).as_secs();
            let floor = (n as u64).pow(4) + 15;
            let ceiling = floor + 30 * (n as u64 + 1);
            assert!(delay >= floor && delay < ceiling, "n={n} delay={delay}");
        }
    }
}
