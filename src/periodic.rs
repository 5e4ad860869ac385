//! Periodic task manager: enqueues tasks on cron schedules.
//!
//! The authoritative set of entries lives with a user-supplied provider and
//! is re-fetched on an interval, so entries can be added or removed at
//! runtime without restarting anything. Entries are diffed by a stable hash
//! of their content. A per-(entry, fire-time) uniqueness lock keeps replicas
//! running the same provider from double-enqueueing a fire.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info};

use crate::client::Client;
use crate::error::{Error, Result};
use crate::task::Task;

/// How often the provider is re-fetched
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(3 * 60);

/// Tick granularity for firing due entries
const FIRE_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// TTL of the per-fire dedup lock: longer than any provider-sync skew
/// between replicas, shorter than the gap between two fires of a
/// minute-granularity schedule family
const FIRE_DEDUP_TTL: Duration = Duration::from_secs(10 * 60);

/// One cron entry: a schedule plus the task template it enqueues
#[derive(Debug, Clone)]
pub struct PeriodicTaskConfig {
    /// Standard cron expression with seconds
    /// (`sec min hour day-of-month month day-of-week [year]`)
    pub cron_spec: String,
    pub task: Task,
}

impl PeriodicTaskConfig {
    pub fn new<S: Into<String>>(cron_spec: S, task: Task) -> Self {
        Self {
            cron_spec: cron_spec.into(),
            task,
        }
    }

    /// Stable identity of an entry, used to diff provider fetches
    pub fn hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.cron_spec.hash(&mut hasher);
        self.task.task_type().hash(&mut hasher);
        self.task.payload().hash(&mut hasher);
        self.task.options().queue.hash(&mut hasher);
        hasher.finish()
    }
}

/// Source of truth for the periodic entries
#[async_trait]
pub trait PeriodicTaskConfigProvider: Send + Sync {
    async fn get_configs(&self) -> Result<Vec<PeriodicTaskConfig>>;
}

struct Entry {
    config: PeriodicTaskConfig,
    schedule: Schedule,
    next_fire: Option<DateTime<Utc>>,
}

/// Drives cron entries, enqueueing a task each time one fires
pub struct PeriodicTaskManager {
    client: Client,
    provider: Arc<dyn PeriodicTaskConfigProvider>,
    sync_interval: Duration,
    entries: Mutex<HashMap<u64, Entry>>,
    synced_once: std::sync::atomic::AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl PeriodicTaskManager {
    pub fn new(client: Client, provider: Arc<dyn PeriodicTaskConfigProvider>) -> Self {
        Self::with_sync_interval(client, provider, DEFAULT_SYNC_INTERVAL)
    }

    pub fn with_sync_interval(
        client: Client,
        provider: Arc<dyn PeriodicTaskConfigProvider>,
        sync_interval: Duration,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            client,
            provider,
            sync_interval,
            entries: Mutex::new(HashMap::new()),
            synced_once: std::sync::atomic::AtomicBool::new(false),
            shutdown_tx,
        }
    }

    /// Run until [`PeriodicTaskManager::shutdown`] is called
    pub async fn run(&self) -> Result<()> {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut sync_timer = tokio::time::interval(self.sync_interval);
        let mut fire_timer = tokio::time::interval(FIRE_CHECK_INTERVAL);
        sync_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        fire_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("periodic task manager started");

        loop {
            tokio::select! {
                _ = sync_timer.tick() => self.sync().await,
                _ = fire_timer.tick() => self.fire_due_entries().await,
                _ = shutdown.changed() => break,
            }
        }
        info!("periodic task manager stopped");
        Ok(())
    }

    /// Stop the manager; in-flight enqueues finish first
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Re-fetch the provider and diff against the running entry set
    async fn sync(&self) {
        let configs = match self.provider.get_configs().await {
            Ok(configs) => configs,
            Err(err) => {
                error!(error = %err, "failed to fetch periodic task configs");
                return;
            }
        };
        self.synced_once
            .store(true, std::sync::atomic::Ordering::Relaxed);

        let mut incoming: HashMap<u64, PeriodicTaskConfig> =
            configs.into_iter().map(|c| (c.hash(), c)).collect();
        let mut entries = self.entries.lock().await;

        let before = entries.len();
        entries.retain(|hash, entry| {
            let keep = incoming.contains_key(hash);
            if !keep {
                info!(cron = %entry.config.cron_spec, "periodic entry removed");
            }
            keep
        });
        let removed = before - entries.len();

        let mut added = 0usize;
        for (hash, config) in incoming.drain() {
            if entries.contains_key(&hash) {
                continue;
            }
            let schedule = match Schedule::from_str(&config.cron_spec) {
                Ok(schedule) => schedule,
                Err(err) => {
                    error!(cron = %config.cron_spec, error = %err, "invalid cron spec, skipping entry");
                    continue;
                }
            };
            let next_fire = schedule.after(&Utc::now()).next();
            info!(
                cron = %config.cron_spec,
                task_type = %config.task.task_type(),
                next = ?next_fire,
                "periodic entry added"
            );
            entries.insert(
                hash,
                Entry {
                    config,
                    schedule,
                    next_fire,
                },
            );
            added += 1;
        }
        if added > 0 || removed > 0 {
            debug!(added, removed, total = entries.len(), "periodic entries synced");
        }
    }

    async fn fire_due_entries(&self) {
        // eager first fetch so a fresh manager fires without waiting a full
        // sync interval
        if !self.synced_once.load(std::sync::atomic::Ordering::Relaxed) {
            self.sync().await;
        }

        let now = Utc::now();
        let due: Vec<(u64, DateTime<Utc>, Task)> = {
            let entries = self.entries.lock().await;
            entries
                .iter()
                .filter_map(|(hash, entry)| match entry.next_fire {
                    Some(at) if at <= now => Some((*hash, at, entry.config.task.clone())),
                    _ => None,
                })
                .collect()
        };

        for (hash, fire_time, task) in due {
            self.enqueue_fire(hash, fire_time, task).await;
            let mut entries = self.entries.lock().await;
            if let Some(entry) = entries.get_mut(&hash) {
                entry.next_fire = entry.schedule.after(&now).next();
            }
        }
    }

    async fn enqueue_fire(&self, hash: u64, fire_time: DateTime<Utc>, task: Task) {
        let dedup_key = format!("periodic:{:016x}:{}", hash, fire_time.timestamp());
        let task = task.unique_key(dedup_key, FIRE_DEDUP_TTL);
        match self.client.enqueue(task).await {
            Ok(info) => {
                info!(id = %info.id, task_type = %info.task_type, at = %fire_time, "periodic task enqueued");
            }
            Err(Error::DuplicateUnique) => {
                // another replica won this fire
                debug!(at = %fire_time, "periodic fire already enqueued elsewhere");
            }
            Err(err) => {
                error!(error = %err, "failed to enqueue periodic task");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_hash_is_stable_and_content_sensitive() {
        let a = PeriodicTaskConfig::new("0 * * * * *", Task::new("report:daily", b"x".to_vec()));
        let b = PeriodicTaskConfig::new("0 * * * * *", Task::new("report:daily", b"x".to_vec()));
        let c = PeriodicTaskConfig::new("0 0 * * * *", Task::new("report:daily", b"x".to_vec()));
        let d = PeriodicTaskConfig::new("0 * * * * *", Task::new("report:weekly", b"x".to_vec()));
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), c.hash());
        assert_ne!(a.hash(), d.hash());
    }

    #[test]
    fn queue_option_changes_the_hash() {
        let a = PeriodicTaskConfig::new("0 * * * * *", Task::new("t", vec![]));
        let b = PeriodicTaskConfig::new("0 * * * * *", Task::new("t", vec![]).queue("other"));
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn schedules_compute_future_fire_times() {
        let schedule = Schedule::from_str("0 * * * * *").unwrap();
        let now = Utc::now();
        let next = schedule.after(&now).next().unwrap();
        assert!(next > now);
        assert!(next <= now + chrono::Duration::seconds(60));
    }
}
