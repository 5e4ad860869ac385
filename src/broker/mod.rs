//! Broker façade over the atomic script layer.
//!
//! The store owns all durable task state; every multi-key transition goes
//! through one of the scripts in [`scripts`] so that concurrent servers only
//! ever observe complete transitions. This module adds key naming, task
//! message encoding, and translation of script status codes into typed
//! errors.

pub mod keys;
pub mod scripts;

use chrono::{DateTime, Duration, TimeZone, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::task::{TaskInfo, TaskMessage, TaskState};

/// Set of queue names that have ever seen a task
const ALL_QUEUES: &str = "dispatchq:queues";

/// Archived tasks older than this are evicted
const ARCHIVED_EXPIRATION_SECS: i64 = 90 * 24 * 60 * 60;

/// The archive keeps at most this many tasks
const MAX_ARCHIVE_SIZE: i64 = 10_000;

/// A server's identity record, written by its heartbeat
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub host: String,
    pub pid: u32,
    pub server_id: String,
    pub concurrency: usize,
    pub queues: HashMap<String, u32>,
    pub strict_priority: bool,
    /// "active" or "closed"
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub active_workers: usize,
}

/// Snapshot of one in-flight task, written alongside [`ServerInfo`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub task_id: String,
    pub task_type: String,
    pub queue: String,
    pub started_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

struct Scripts {
    enqueue: Script,
    enqueue_unique: Script,
    schedule: Script,
    schedule_unique: Script,
    add_to_group: Script,
    add_to_group_unique: Script,
    dequeue: Script,
    done: Script,
    done_unique: Script,
    mark_complete: Script,
    mark_complete_unique: Script,
    retry: Script,
    archive: Script,
    forward: Script,
    extend_lease: Script,
    list_lease_expired: Script,
    requeue: Script,
    aggregation_check: Script,
    read_aggregation_set: Script,
    delete_aggregation_set: Script,
    reclaim_stale_aggregation_sets: Script,
    delete_expired_completed: Script,
    write_server_state: Script,
    clear_server_state: Script,
    remove_queue: Script,
    write_result: Script,
    get_task_info: Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            enqueue: Script::new(scripts::ENQUEUE),
            enqueue_unique: Script::new(scripts::ENQUEUE_UNIQUE),
            schedule: Script::new(scripts::SCHEDULE),
            schedule_unique: Script::new(scripts::SCHEDULE_UNIQUE),
            add_to_group: Script::new(scripts::ADD_TO_GROUP),
            add_to_group_unique: Script::new(scripts::ADD_TO_GROUP_UNIQUE),
            dequeue: Script::new(scripts::DEQUEUE),
            done: Script::new(scripts::DONE),
            done_unique: Script::new(scripts::DONE_UNIQUE),
            mark_complete: Script::new(scripts::MARK_COMPLETE),
            mark_complete_unique: Script::new(scripts::MARK_COMPLETE_UNIQUE),
            retry: Script::new(scripts::RETRY),
            archive: Script::new(scripts::ARCHIVE),
            forward: Script::new(scripts::FORWARD),
            extend_lease: Script::new(scripts::EXTEND_LEASE),
            list_lease_expired: Script::new(scripts::LIST_LEASE_EXPIRED),
            requeue: Script::new(scripts::REQUEUE),
            aggregation_check: Script::new(scripts::AGGREGATION_CHECK),
            read_aggregation_set: Script::new(scripts::READ_AGGREGATION_SET),
            delete_aggregation_set: Script::new(scripts::DELETE_AGGREGATION_SET),
            reclaim_stale_aggregation_sets: Script::new(scripts::RECLAIM_STALE_AGGREGATION_SETS),
            delete_expired_completed: Script::new(scripts::DELETE_EXPIRED_COMPLETED),
            write_server_state: Script::new(scripts::WRITE_SERVER_STATE),
            clear_server_state: Script::new(scripts::CLEAR_SERVER_STATE),
            remove_queue: Script::new(scripts::REMOVE_QUEUE),
            write_result: Script::new(scripts::WRITE_RESULT),
            get_task_info: Script::new(scripts::GET_TASK_INFO),
        }
    }
}

/// Typed operations over the shared store
pub struct Broker {
    client: redis::Client,
    conn: ConnectionManager,
    scripts: Scripts,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker").finish_non_exhaustive()
    }
}

impl Broker {
    /// Connect to the store and verify it responds
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let mut conn = client.get_connection_manager().await?;

        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!("connected to redis at {}", redis_url);

        Ok(Self {
            client,
            conn,
            scripts: Scripts::new(),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }

    /// Liveness probe used by the health-check loop
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    /// A dedicated pub/sub connection (pub/sub cannot share the multiplexed
    /// command connection)
    pub async fn pubsub(&self) -> Result<redis::aio::PubSub> {
        Ok(self.client.get_async_pubsub().await?)
    }

    fn status_to_result(status: i64, id: &str) -> Result<()> {
        match status {
            1 => Ok(()),
            0 => Err(Error::TaskIdConflict { id: id.to_string() }),
            -1 => Err(Error::DuplicateUnique),
            other => Err(Error::invalid_argument(format!(
                "unexpected script status: {other}"
            ))),
        }
    }

    fn settle_error(err: redis::RedisError, id: &str) -> Error {
        if err.kind() == redis::ErrorKind::ResponseError && err.to_string().contains("NOT FOUND") {
            Error::LeaseExpired { id: id.to_string() }
        } else {
            Error::Redis(err)
        }
    }

    /// Insert a task into `pending`
    pub async fn enqueue(&self, msg: &TaskMessage) -> Result<()> {
        let mut conn = self.conn();
        conn.sadd::<_, _, ()>(ALL_QUEUES, &msg.queue).await?;
        let status: i64 = self
            .scripts
            .enqueue
            .key(keys::task_key(&msg.queue, &msg.id))
            .key(keys::pending_key(&msg.queue))
            .arg(msg.encode()?)
            .arg(&msg.id)
            .arg(Utc::now().timestamp())
            .invoke_async(&mut conn)
            .await?;
        Self::status_to_result(status, &msg.id)?;
        debug!(id = %msg.id, queue = %msg.queue, "enqueued task");
        Ok(())
    }

    /// Insert a task into `pending`, holding its uniqueness lock for `ttl`
    pub async fn enqueue_unique(&self, msg: &TaskMessage, ttl: Duration) -> Result<()> {
        let mut conn = self.conn();
        conn.sadd::<_, _, ()>(ALL_QUEUES, &msg.queue).await?;
        let status: i64 = self
            .scripts
            .enqueue_unique
            .key(&msg.unique_key)
            .key(keys::task_key(&msg.queue, &msg.id))
            .key(keys::pending_key(&msg.queue))
            .arg(&msg.id)
            .arg(ttl.num_seconds().max(1))
            .arg(msg.encode()?)
            .arg(Utc::now().timestamp())
            .invoke_async(&mut conn)
            .await?;
        Self::status_to_result(status, &msg.id)
    }

    /// Insert a task into `scheduled` with its process-at time
    pub async fn schedule(&self, msg: &TaskMessage, process_at: DateTime<Utc>) -> Result<()> {
        let mut conn = self.conn();
        conn.sadd::<_, _, ()>(ALL_QUEUES, &msg.queue).await?;
        let status: i64 = self
            .scripts
            .schedule
            .key(keys::task_key(&msg.queue, &msg.id))
            .key(keys::scheduled_key(&msg.queue))
            .arg(msg.encode()?)
            .arg(process_at.timestamp())
            .arg(&msg.id)
            .arg(&msg.group_key)
            .invoke_async(&mut conn)
            .await?;
        Self::status_to_result(status, &msg.id)?;
        debug!(id = %msg.id, queue = %msg.queue, at = %process_at, "scheduled task");
        Ok(())
    }

    /// Insert a task into `scheduled`, holding its uniqueness lock for `ttl`
    pub async fn schedule_unique(
        &self,
        msg: &TaskMessage,
        process_at: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<()> {
        let mut conn = self.conn();
        conn.sadd::<_, _, ()>(ALL_QUEUES, &msg.queue).await?;
        let status: i64 = self
            .scripts
            .schedule_unique
            .key(&msg.unique_key)
            .key(keys::task_key(&msg.queue, &msg.id))
            .key(keys::scheduled_key(&msg.queue))
            .arg(&msg.id)
            .arg(ttl.num_seconds().max(1))
            .arg(msg.encode()?)
            .arg(process_at.timestamp())
            .arg(&msg.group_key)
            .invoke_async(&mut conn)
            .await?;
        Self::status_to_result(status, &msg.id)
    }

    /// Insert a task into its aggregation group
    pub async fn add_to_group(&self, msg: &TaskMessage, group: &str) -> Result<()> {
        let mut conn = self.conn();
        conn.sadd::<_, _, ()>(ALL_QUEUES, &msg.queue).await?;
        let status: i64 = self
            .scripts
            .add_to_group
            .key(keys::task_key(&msg.queue, &msg.id))
            .key(keys::group_key(&msg.queue, group))
            .key(keys::all_groups_key(&msg.queue))
            .arg(msg.encode()?)
            .arg(&msg.id)
            .arg(Utc::now().timestamp())
            .arg(group)
            .invoke_async(&mut conn)
            .await?;
        Self::status_to_result(status, &msg.id)?;
        debug!(id = %msg.id, queue = %msg.queue, group, "added task to group");
        Ok(())
    }

    /// Insert a task into its aggregation group, holding its uniqueness lock
    pub async fn add_to_group_unique(
        &self,
        msg: &TaskMessage,
        group: &str,
        ttl: Duration,
    ) -> Result<()> {
        let mut conn = self.conn();
        conn.sadd::<_, _, ()>(ALL_QUEUES, &msg.queue).await?;
        let status: i64 = self
            .scripts
            .add_to_group_unique
            .key(&msg.unique_key)
            .key(keys::task_key(&msg.queue, &msg.id))
            .key(keys::group_key(&msg.queue, group))
            .key(keys::all_groups_key(&msg.queue))
            .arg(&msg.id)
            .arg(ttl.num_seconds().max(1))
            .arg(msg.encode()?)
            .arg(Utc::now().timestamp())
            .arg(group)
            .invoke_async(&mut conn)
            .await?;
        Self::status_to_result(status, &msg.id)
    }

    /// Pop the first task from the first non-paused, non-empty queue, in the
    /// given order, leasing it until `now + lease_duration`.
    ///
    /// Returns `None` when every queue is empty or paused.
    pub async fn dequeue(
        &self,
        qnames: &[String],
        lease_duration: std::time::Duration,
    ) -> Result<Option<(TaskMessage, DateTime<Utc>)>> {
        let mut conn = self.conn();
        for qname in qnames {
            let lease_expiry = Utc::now()
                + Duration::from_std(lease_duration).unwrap_or_else(|_| Duration::seconds(30));
            let data: Option<Vec<u8>> = self
                .scripts
                .dequeue
                .key(keys::pending_key(qname))
                .key(keys::paused_key(qname))
                .key(keys::active_key(qname))
                .key(keys::lease_key(qname))
                .arg(lease_expiry.timestamp())
                .arg(keys::task_prefix(qname))
                .invoke_async(&mut conn)
                .await?;
            if let Some(data) = data {
                let msg = TaskMessage::decode(&data)?;
                debug!(id = %msg.id, queue = %qname, "dequeued task");
                return Ok(Some((msg, lease_expiry)));
            }
        }
        Ok(None)
    }

    /// Remove a finished task entirely
    pub async fn done(&self, msg: &TaskMessage) -> Result<()> {
        let mut conn = self.conn();
        let result: std::result::Result<(), redis::RedisError> = if msg.unique_key.is_empty() {
            self.scripts
                .done
                .key(keys::active_key(&msg.queue))
                .key(keys::lease_key(&msg.queue))
                .key(keys::task_key(&msg.queue, &msg.id))
                .arg(&msg.id)
                .invoke_async(&mut conn)
                .await
        } else {
            self.scripts
                .done_unique
                .key(keys::active_key(&msg.queue))
                .key(keys::lease_key(&msg.queue))
                .key(keys::task_key(&msg.queue, &msg.id))
                .key(&msg.unique_key)
                .arg(&msg.id)
                .invoke_async(&mut conn)
                .await
        };
        result.map_err(|err| Self::settle_error(err, &msg.id))?;
        debug!(id = %msg.id, queue = %msg.queue, "task done");
        Ok(())
    }

    /// Retain a finished task in `completed` until its retention expires
    pub async fn mark_complete(&self, msg: &TaskMessage) -> Result<()> {
        let mut conn = self.conn();
        let now = Utc::now();
        let mut updated = msg.clone();
        updated.completed_at = now.timestamp();
        let expire_at = now.timestamp() + msg.retention;

        let result: std::result::Result<(), redis::RedisError> = if msg.unique_key.is_empty() {
            self.scripts
                .mark_complete
                .key(keys::active_key(&msg.queue))
                .key(keys::lease_key(&msg.queue))
                .key(keys::completed_key(&msg.queue))
                .key(keys::task_key(&msg.queue, &msg.id))
                .arg(&msg.id)
                .arg(expire_at)
                .arg(updated.encode()?)
                .invoke_async(&mut conn)
                .await
        } else {
            self.scripts
                .mark_complete_unique
                .key(keys::active_key(&msg.queue))
                .key(keys::lease_key(&msg.queue))
                .key(keys::completed_key(&msg.queue))
                .key(keys::task_key(&msg.queue, &msg.id))
                .key(&msg.unique_key)
                .arg(&msg.id)
                .arg(expire_at)
                .arg(updated.encode()?)
                .invoke_async(&mut conn)
                .await
        };
        result.map_err(|err| Self::settle_error(err, &msg.id))?;
        debug!(id = %msg.id, queue = %msg.queue, "task completed with retention");
        Ok(())
    }

    /// Move a failed task into `retry`, recording the failure.
    ///
    /// `is_failure` is false when the attempt did not consume a retry (the
    /// failure predicate rejected the error); the retry counter then stays
    /// untouched.
    pub async fn retry(
        &self,
        msg: &TaskMessage,
        retry_at: DateTime<Utc>,
        err_msg: &str,
        is_failure: bool,
    ) -> Result<()> {
        let mut conn = self.conn();
        let mut updated = msg.clone();
        updated.last_err = err_msg.to_string();
        if is_failure {
            updated.retried += 1;
            updated.last_failed_at = Utc::now().timestamp();
        }

        let _: () = self
            .scripts
            .retry
            .key(keys::task_key(&msg.queue, &msg.id))
            .key(keys::active_key(&msg.queue))
            .key(keys::lease_key(&msg.queue))
            .key(keys::retry_key(&msg.queue))
            .arg(&msg.id)
            .arg(updated.encode()?)
            .arg(retry_at.timestamp())
            .invoke_async(&mut conn)
            .await
            .map_err(|err| Self::settle_error(err, &msg.id))?;
        debug!(id = %msg.id, queue = %msg.queue, at = %retry_at, "task moved to retry");
        Ok(())
    }

    /// Move a failed task into `archived`, recording the failure and
    /// trimming the archive by age then capacity
    pub async fn archive(&self, msg: &TaskMessage, err_msg: &str) -> Result<()> {
        let mut conn = self.conn();
        let now = Utc::now();
        let mut updated = msg.clone();
        updated.last_err = err_msg.to_string();
        updated.last_failed_at = now.timestamp();

        let _: () = self
            .scripts
            .archive
            .key(keys::task_key(&msg.queue, &msg.id))
            .key(keys::active_key(&msg.queue))
            .key(keys::lease_key(&msg.queue))
            .key(keys::archived_key(&msg.queue))
            .arg(&msg.id)
            .arg(updated.encode()?)
            .arg(now.timestamp())
            .arg(now.timestamp() - ARCHIVED_EXPIRATION_SECS)
            .arg(MAX_ARCHIVE_SIZE)
            .arg(keys::task_prefix(&msg.queue))
            .invoke_async(&mut conn)
            .await
            .map_err(|err| Self::settle_error(err, &msg.id))?;
        debug!(id = %msg.id, queue = %msg.queue, "task archived");
        Ok(())
    }

    /// Promote due entries from `scheduled` and `retry` into `pending`
    /// (entries with a group rejoin their group instead). Returns the number
    /// promoted.
    pub async fn forward(&self, qname: &str) -> Result<u64> {
        let mut conn = self.conn();
        let now = Utc::now().timestamp();
        let mut moved = 0u64;
        for src in [keys::scheduled_key(qname), keys::retry_key(qname)] {
            loop {
                let n: u64 = self
                    .scripts
                    .forward
                    .key(&src)
                    .key(keys::pending_key(qname))
                    .arg(now)
                    .arg(keys::task_prefix(qname))
                    .arg(keys::group_prefix(qname))
                    .invoke_async(&mut conn)
                    .await?;
                moved += n;
                // the script caps each pass at 100
                if n < 100 {
                    break;
                }
            }
        }
        Ok(moved)
    }

    /// Extend the leases of the given tasks; a lease already taken over by
    /// another server is left alone
    pub async fn extend_lease(
        &self,
        qname: &str,
        ids: &[String],
        new_expiry: DateTime<Utc>,
    ) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        let mut invocation = self.scripts.extend_lease.key(keys::lease_key(qname));
        invocation.arg(new_expiry.timestamp());
        for id in ids {
            invocation.arg(id);
        }
        let _: () = invocation.invoke_async(&mut conn).await?;
        Ok(())
    }

    /// Messages of tasks whose lease expired at or before the cutoff
    pub async fn list_lease_expired(
        &self,
        qname: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<TaskMessage>> {
        let mut conn = self.conn();
        let blobs: Vec<Vec<u8>> = self
            .scripts
            .list_lease_expired
            .key(keys::lease_key(qname))
            .arg(cutoff.timestamp())
            .arg(keys::task_prefix(qname))
            .invoke_async(&mut conn)
            .await?;
        blobs.iter().map(|b| TaskMessage::decode(b)).collect()
    }

    /// Push an abandoned active task back to the head of `pending`
    pub async fn requeue(&self, msg: &TaskMessage) -> Result<()> {
        let mut conn = self.conn();
        let _: () = self
            .scripts
            .requeue
            .key(keys::active_key(&msg.queue))
            .key(keys::lease_key(&msg.queue))
            .key(keys::pending_key(&msg.queue))
            .key(keys::task_key(&msg.queue, &msg.id))
            .arg(&msg.id)
            .invoke_async(&mut conn)
            .await
            .map_err(|err| Self::settle_error(err, &msg.id))?;
        debug!(id = %msg.id, queue = %msg.queue, "task requeued");
        Ok(())
    }

    /// Group names currently holding aggregating tasks
    pub async fn list_groups(&self, qname: &str) -> Result<Vec<String>> {
        let mut conn = self.conn();
        Ok(conn.smembers(keys::all_groups_key(qname)).await?)
    }

    /// Check one group against the aggregation policy; on trigger the batch
    /// is snapshotted into the aggregation set named `set_id`.
    ///
    /// Returns true when the set was created.
    #[allow(clippy::too_many_arguments)]
    pub async fn aggregation_check(
        &self,
        qname: &str,
        group: &str,
        set_id: &str,
        max_size: u64,
        max_delay: std::time::Duration,
        grace_period: std::time::Duration,
        set_expiry: DateTime<Utc>,
    ) -> Result<bool> {
        let mut conn = self.conn();
        let created: i64 = self
            .scripts
            .aggregation_check
            .key(keys::group_key(qname, group))
            .key(keys::aggregation_set_key(qname, group, set_id))
            .key(keys::all_aggregation_sets_key(qname))
            .key(keys::all_groups_key(qname))
            .arg(max_size)
            .arg(max_delay.as_secs())
            .arg(grace_period.as_secs())
            .arg(set_expiry.timestamp())
            .arg(Utc::now().timestamp())
            .arg(group)
            .invoke_async(&mut conn)
            .await?;
        Ok(created == 1)
    }

    /// Messages of every member of an aggregation set, oldest first
    pub async fn read_aggregation_set(
        &self,
        qname: &str,
        group: &str,
        set_id: &str,
    ) -> Result<Vec<TaskMessage>> {
        let mut conn = self.conn();
        let blobs: Vec<Vec<u8>> = self
            .scripts
            .read_aggregation_set
            .key(keys::aggregation_set_key(qname, group, set_id))
            .arg(keys::task_prefix(qname))
            .invoke_async(&mut conn)
            .await?;
        blobs.iter().map(|b| TaskMessage::decode(b)).collect()
    }

    /// Delete an aggregation set and its members once the combined task has
    /// been enqueued
    pub async fn delete_aggregation_set(
        &self,
        qname: &str,
        group: &str,
        set_id: &str,
    ) -> Result<()> {
        let mut conn = self.conn();
        let _: () = self
            .scripts
            .delete_aggregation_set
            .key(keys::aggregation_set_key(qname, group, set_id))
            .key(keys::all_aggregation_sets_key(qname))
            .arg(keys::task_prefix(qname))
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Return members of expired aggregation sets to their groups
    pub async fn reclaim_stale_aggregation_sets(&self, qname: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: () = self
            .scripts
            .reclaim_stale_aggregation_sets
            .key(keys::all_aggregation_sets_key(qname))
            .arg(Utc::now().timestamp())
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Delete up to `batch_size` completed tasks whose retention expired.
    /// Returns the number deleted.
    pub async fn delete_expired_completed(&self, qname: &str, batch_size: u64) -> Result<u64> {
        let mut conn = self.conn();
        let n: u64 = self
            .scripts
            .delete_expired_completed
            .key(keys::completed_key(qname))
            .arg(Utc::now().timestamp())
            .arg(keys::task_prefix(qname))
            .arg(batch_size)
            .invoke_async(&mut conn)
            .await?;
        Ok(n)
    }

    /// Write the server identity record and worker snapshots with a TTL
    pub async fn write_server_state(
        &self,
        info: &ServerInfo,
        workers: &[WorkerInfo],
        ttl: std::time::Duration,
    ) -> Result<()> {
        let mut conn = self.conn();
        let expiry = Utc::now().timestamp() + ttl.as_secs() as i64;
        let mut invocation = self
            .scripts
            .write_server_state
            .key(keys::server_info_key(&info.host, info.pid, &info.server_id));
        invocation
            .key(keys::workers_key(&info.host, info.pid, &info.server_id))
            .key(keys::ALL_SERVERS)
            .key(keys::ALL_WORKERS)
            .arg(ttl.as_secs())
            .arg(expiry)
            .arg(serde_json::to_vec(info)?);
        for worker in workers {
            invocation.arg(&worker.task_id).arg(serde_json::to_vec(worker)?);
        }
        let _: () = invocation.invoke_async(&mut conn).await?;
        Ok(())
    }

    /// Delete the server identity record, marking a prompt shutdown
    pub async fn clear_server_state(&self, host: &str, pid: u32, server_id: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: () = self
            .scripts
            .clear_server_state
            .key(keys::server_info_key(host, pid, server_id))
            .key(keys::workers_key(host, pid, server_id))
            .key(keys::ALL_SERVERS)
            .key(keys::ALL_WORKERS)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Identity records of servers whose heartbeat is still fresh
    pub async fn list_servers(&self) -> Result<Vec<ServerInfo>> {
        let mut conn = self.conn();
        let now = Utc::now().timestamp();
        let server_keys: Vec<String> = conn
            .zrangebyscore(keys::ALL_SERVERS, now, "+inf")
            .await?;
        let mut servers = Vec::with_capacity(server_keys.len());
        for key in server_keys {
            let data: Option<Vec<u8>> = conn.get(&key).await?;
            if let Some(data) = data {
                servers.push(serde_json::from_slice(&data)?);
            }
        }
        Ok(servers)
    }

    /// Stop dequeues from a queue
    pub async fn pause_queue(&self, qname: &str) -> Result<()> {
        let mut conn = self.conn();
        let set: bool = conn.set_nx(keys::paused_key(qname), Utc::now().timestamp()).await?;
        if !set {
            return Err(Error::invalid_argument(format!(
                "queue {qname} is already paused"
            )));
        }
        info!(queue = %qname, "queue paused");
        Ok(())
    }

    /// Resume dequeues from a queue
    pub async fn unpause_queue(&self, qname: &str) -> Result<()> {
        let mut conn = self.conn();
        let removed: u64 = conn.del(keys::paused_key(qname)).await?;
        if removed == 0 {
            return Err(Error::invalid_argument(format!(
                "queue {qname} is not paused"
            )));
        }
        info!(queue = %qname, "queue unpaused");
        Ok(())
    }

    /// Remove a queue and every key under it. Without `force` the queue must
    /// hold no tasks; active tasks block removal either way.
    pub async fn remove_queue(&self, qname: &str, force: bool) -> Result<()> {
        let mut conn = self.conn();
        let known: bool = conn.sismember(ALL_QUEUES, qname).await?;
        if !known {
            return Err(Error::QueueNotFound {
                queue: qname.to_string(),
            });
        }
        let status: i64 = self
            .scripts
            .remove_queue
            .key(keys::pending_key(qname))
            .key(keys::active_key(qname))
            .key(keys::scheduled_key(qname))
            .key(keys::retry_key(qname))
            .key(keys::archived_key(qname))
            .key(keys::completed_key(qname))
            .key(keys::lease_key(qname))
            .key(keys::paused_key(qname))
            .arg(keys::task_prefix(qname))
            .arg(if force { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await?;
        match status {
            1 => {
                conn.srem::<_, _, ()>(ALL_QUEUES, qname).await?;
                info!(queue = %qname, "queue removed");
                Ok(())
            }
            -1 | -2 => Err(Error::QueueNotEmpty {
                queue: qname.to_string(),
            }),
            other => Err(Error::invalid_argument(format!(
                "unexpected script status: {other}"
            ))),
        }
    }

    /// Broadcast a cancellation event for the given task id
    pub async fn publish_cancellation(&self, id: &str) -> Result<()> {
        let mut conn = self.conn();
        conn.publish::<_, _, ()>(keys::CANCELLATION_CHANNEL, id).await?;
        Ok(())
    }

    /// Persist handler-produced result bytes on the task hash; a no-op when
    /// the task was deleted while the handler ran
    pub async fn write_result(&self, qname: &str, id: &str, result: &[u8]) -> Result<()> {
        let mut conn = self.conn();
        let _: i64 = self
            .scripts
            .write_result
            .key(keys::task_key(qname, id))
            .arg(result)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Durable state of one task, for inspection
    pub async fn get_task_info(&self, qname: &str, id: &str) -> Result<TaskInfo> {
        let mut conn = self.conn();
        let value: Value = self
            .scripts
            .get_task_info
            .key(keys::task_key(qname, id))
            .arg(id)
            .arg(Utc::now().timestamp())
            .arg(keys::queue_prefix(qname))
            .invoke_async(&mut conn)
            .await
            .map_err(|err| {
                if err.kind() == redis::ErrorKind::ResponseError
                    && err.to_string().contains("NOT FOUND")
                {
                    Error::TaskNotFound { id: id.to_string() }
                } else {
                    Error::Redis(err)
                }
            })?;

        let items = match value {
            Value::Bulk(items) if items.len() == 4 => items,
            other => {
                return Err(Error::invalid_argument(format!(
                    "unexpected task info reply: {other:?}"
                )))
            }
        };

        let msg_bytes: Vec<u8> = redis::from_redis_value(&items[0])?;
        let state_str: String = redis::from_redis_value(&items[1])?;
        let next_ts = match &items[2] {
            Value::Int(n) => *n as f64,
            Value::Data(bytes) => std::str::from_utf8(bytes)
                .ok()
                .and_then(|s| s.parse::<f64>().ok())
                .unwrap_or(0.0),
            _ => 0.0,
        };
        let result: Option<Vec<u8>> = redis::from_redis_value(&items[3])?;

        let msg = TaskMessage::decode(&msg_bytes)?;
        let state = TaskState::parse(&state_str)?;
        let next_process_at = if next_ts > 0.0 {
            Utc.timestamp_opt(next_ts as i64, 0).single()
        } else {
            None
        };
        Ok(TaskInfo::from_message(msg, state, next_process_at, result))
    }
}
