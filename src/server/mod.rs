//! Server: background loops and their supervisor.
//!
//! A server runs one processor pool plus singleton loops (heartbeat,
//! subscriber, syncer, recoverer, forwarder, janitor, aggregator). All loops
//! log and continue on errors; none of them terminates the server. Loops use
//! the local clock for store scores, so servers sharing a store are expected
//! to run clock sync.

mod aggregator;
mod forwarder;
mod heartbeat;
mod janitor;
mod processor;
mod recoverer;
mod subscriber;
mod syncer;

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::broker::Broker;
use crate::error::{Error, Result};
use crate::handler::ServeMux;
use crate::task::{Task, TaskMessage, DEFAULT_QUEUE};

use processor::ActiveRegistry;
use syncer::SyncRequest;

pub use processor::default_retry_delay;

/// Computes the delay before the n-th retry of a failed task
pub type RetryDelayFn =
    Arc<dyn Fn(u32, &anyhow::Error, &TaskMessage) -> Duration + Send + Sync>;

/// Decides whether a handler error counts against the retry budget
pub type IsFailureFn = Arc<dyn Fn(&anyhow::Error) -> bool + Send + Sync>;

/// Receives the outcome of each periodic store probe
pub type HealthCheckFn = Arc<dyn Fn(Option<&Error>) + Send + Sync>;

/// Combines the tasks of one group into a single batched task.
///
/// The combined task is enqueued to the group's queue; its own group option
/// is ignored so batches never re-aggregate.
pub trait GroupAggregator: Send + Sync {
    fn aggregate(&self, group: &str, tasks: Vec<Task>) -> Task;
}

/// Server configuration. `Default` gives a single `default` queue at
/// priority 1 with one worker per CPU.
#[derive(Clone)]
pub struct ServerConfig {
    /// Size of the worker pool
    pub concurrency: usize,
    /// Queues to poll, with their priorities (or weights)
    pub queues: HashMap<String, u32>,
    /// Always drain higher-priority queues first instead of weighted sampling
    pub strict_priority: bool,
    pub retry_delay: RetryDelayFn,
    pub is_failure: IsFailureFn,
    /// How long shutdown waits for in-flight handlers
    pub shutdown_timeout: Duration,
    pub health_check: Option<HealthCheckFn>,
    pub health_check_interval: Duration,
    /// Cadence of the forwarder promoting scheduled/retry tasks
    pub delayed_task_check_interval: Duration,
    /// Aggregate a group once no new task arrived for this long
    pub group_grace_period: Duration,
    /// Aggregate a group once its oldest task is this old (zero = disabled)
    pub group_max_delay: Duration,
    /// Aggregate a group once it holds this many tasks (zero = disabled)
    pub group_max_size: u64,
    pub group_aggregator: Option<Arc<dyn GroupAggregator>>,
    pub janitor_interval: Duration,
    pub janitor_batch_size: u64,
    /// How long a dequeued task stays owned before the recoverer may take it
    pub lease_duration: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            queues: HashMap::from([(DEFAULT_QUEUE.to_string(), 1)]),
            strict_priority: false,
            retry_delay: Arc::new(default_retry_delay),
            is_failure: Arc::new(|_err: &anyhow::Error| true),
            shutdown_timeout: Duration::from_secs(8),
            health_check: None,
            health_check_interval: Duration::from_secs(15),
            delayed_task_check_interval: Duration::from_secs(5),
            group_grace_period: Duration::from_secs(60),
            group_max_delay: Duration::ZERO,
            group_max_size: 0,
            group_aggregator: None,
            janitor_interval: Duration::from_secs(8),
            janitor_batch_size: 100,
            lease_duration: Duration::from_secs(30),
        }
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("concurrency", &self.concurrency)
            .field("queues", &self.queues)
            .field("strict_priority", &self.strict_priority)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("lease_duration", &self.lease_duration)
            .finish_non_exhaustive()
    }
}

/// State shared by every loop of one server
pub(crate) struct Inner {
    pub(crate) broker: Arc<Broker>,
    pub(crate) config: ServerConfig,
    pub(crate) registry: ActiveRegistry,
    pub(crate) semaphore: Arc<Semaphore>,
    pub(crate) sync_tx: mpsc::Sender<SyncRequest>,
    /// Fired first: the processor stops accepting new tasks
    pub(crate) quit_tx: watch::Sender<bool>,
    /// Fired after in-flight handlers drained: background loops stop
    pub(crate) shutdown_tx: watch::Sender<bool>,
    pub(crate) server_id: String,
    pub(crate) started_at: DateTime<Utc>,
}

impl Inner {
    /// Queue names in configuration order (selection order is computed per
    /// dequeue by the processor)
    pub(crate) fn queue_names(&self) -> Vec<String> {
        self.config.queues.keys().cloned().collect()
    }
}

enum Lifecycle {
    New,
    Running(Vec<(&'static str, JoinHandle<()>)>),
    Stopped,
}

/// A task-processing server: worker pool plus background loops.
pub struct Server {
    inner: Arc<Inner>,
    sync_rx: Mutex<Option<mpsc::Receiver<SyncRequest>>>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
}

impl Server {
    /// Build a server over an existing broker
    pub fn new(broker: Arc<Broker>, mut config: ServerConfig) -> Result<Self> {
        if config.concurrency == 0 {
            config.concurrency = 1;
        }
        if config.queues.is_empty() {
            config.queues.insert(DEFAULT_QUEUE.to_string(), 1);
        }
        if config.queues.values().any(|&p| p == 0) {
            return Err(Error::invalid_argument("queue priority must be at least 1"));
        }
        if config.group_grace_period < Duration::from_secs(1) {
            return Err(Error::invalid_argument(
                "group grace period must be at least 1s",
            ));
        }

        let (sync_tx, sync_rx) = mpsc::channel(config.concurrency.max(8) * 2);
        let (quit_tx, _) = watch::channel(false);
        let (shutdown_tx, _) = watch::channel(false);
        let semaphore = Arc::new(Semaphore::new(config.concurrency));

        let inner = Arc::new(Inner {
            broker,
            registry: ActiveRegistry::new(),
            semaphore,
            sync_tx,
            quit_tx,
            shutdown_tx,
            server_id: uuid::Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            config,
        });

        Ok(Self {
            inner,
            sync_rx: Mutex::new(Some(sync_rx)),
            lifecycle: tokio::sync::Mutex::new(Lifecycle::New),
        })
    }

    /// Connect to the store and build a server
    pub async fn connect(redis_url: &str, config: ServerConfig) -> Result<Self> {
        let broker = Arc::new(Broker::connect(redis_url).await?);
        Self::new(broker, config)
    }

    /// Start every loop. Returns once they are running; use
    /// [`Server::run`] instead to also handle shutdown signals.
    pub async fn start(&self, mux: ServeMux) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        match *lifecycle {
            Lifecycle::New => {}
            _ => return Err(Error::invalid_argument("server already started")),
        }
        let sync_rx = self
            .sync_rx
            .lock()
            .expect("sync receiver poisoned")
            .take()
            .ok_or_else(|| Error::invalid_argument("server already started"))?;

        let mux = Arc::new(mux);
        let inner = &self.inner;
        let mut handles: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        handles.push(("heartbeat", tokio::spawn(heartbeat::run(inner.clone()))));
        handles.push(("subscriber", tokio::spawn(subscriber::run(inner.clone()))));
        handles.push(("syncer", tokio::spawn(syncer::run(inner.clone(), sync_rx))));
        handles.push(("recoverer", tokio::spawn(recoverer::run(inner.clone()))));
        handles.push(("forwarder", tokio::spawn(forwarder::run(inner.clone()))));
        handles.push(("janitor", tokio::spawn(janitor::run(inner.clone()))));
        if inner.config.group_aggregator.is_some() {
            handles.push(("aggregator", tokio::spawn(aggregator::run(inner.clone()))));
        }
        if inner.config.health_check.is_some() {
            handles.push(("healthcheck", tokio::spawn(health_check_loop(inner.clone()))));
        }
        handles.push((
            "processor",
            tokio::spawn(processor::run(inner.clone(), mux)),
        ));

        info!(
            server_id = %inner.server_id,
            concurrency = inner.config.concurrency,
            queues = ?inner.config.queues,
            "server started"
        );
        *lifecycle = Lifecycle::Running(handles);
        Ok(())
    }

    /// Gracefully stop: the processor stops pulling work, in-flight handlers
    /// get up to `shutdown_timeout` (then their cancellation fires), and the
    /// background loops stop in reverse start order.
    pub async fn shutdown(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let handles = match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Running(handles) => handles,
            other => {
                *lifecycle = other;
                return;
            }
        };
        drop(lifecycle);

        let inner = &self.inner;
        info!("starting graceful shutdown");
        let _ = inner.quit_tx.send(true);

        let all = inner.config.concurrency as u32;
        let drained = tokio::time::timeout(
            inner.config.shutdown_timeout,
            inner.semaphore.acquire_many(all),
        )
        .await;
        match drained {
            Ok(Ok(permits)) => drop(permits),
            Ok(Err(_)) => {}
            Err(_) => {
                let cancelled = inner.registry.cancel_all();
                warn!(
                    in_flight = cancelled,
                    "shutdown timeout reached, cancelling remaining handlers"
                );
                match tokio::time::timeout(
                    Duration::from_secs(2),
                    inner.semaphore.acquire_many(all),
                )
                .await
                {
                    Ok(Ok(permits)) => drop(permits),
                    _ => error!("handlers did not stop after cancellation"),
                }
            }
        }

        let _ = inner.shutdown_tx.send(true);
        for (name, handle) in handles.into_iter().rev() {
            if handle.await.is_err() {
                error!(loop_name = name, "server loop panicked");
            }
        }
        info!("server stopped");
    }

    /// Run until SIGINT, then shut down gracefully
    pub async fn run(&self, mux: ServeMux) -> Result<()> {
        self.start(mux).await?;
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for shutdown signal");
        }
        self.shutdown().await;
        Ok(())
    }

    /// The broker this server talks to
    pub fn broker(&self) -> &Arc<Broker> {
        &self.inner.broker
    }
}

async fn health_check_loop(inner: Arc<Inner>) {
    let callback = match &inner.config.health_check {
        Some(cb) => cb.clone(),
        None => return,
    };
    let mut shutdown = inner.shutdown_tx.subscribe();
    let mut interval = tokio::time::interval(inner.config.health_check_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }
        match inner.broker.ping().await {
            Ok(()) => callback(None),
            Err(err) => {
                warn!(error = %err, "store health check failed");
                callback(Some(&err));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_runnable() {
        let config = ServerConfig::default();
        assert!(config.concurrency >= 1);
        assert_eq!(config.queues.get(DEFAULT_QUEUE), Some(&1));
        assert_eq!(config.lease_duration, Duration::from_secs(30));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(8));
        assert!((config.is_failure)(&anyhow::anyhow!("any")));
    }
}
