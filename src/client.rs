//! Client interface for enqueueing tasks

use chrono::Utc;
use std::sync::Arc;

use crate::broker::{keys, Broker};
use crate::error::{Error, Result};
use crate::task::{
    new_task_id, Task, TaskInfo, TaskMessage, TaskState, DEFAULT_MAX_RETRY, DEFAULT_QUEUE,
};

/// Client for submitting tasks to the queue.
///
/// Cheap to clone; clones share the underlying broker connection.
#[derive(Debug, Clone)]
pub struct Client {
    broker: Arc<Broker>,
}

impl Client {
    /// Connect a new client to the store
    pub async fn connect(redis_url: &str) -> Result<Self> {
        Ok(Self {
            broker: Arc::new(Broker::connect(redis_url).await?),
        })
    }

    /// Build a client over an existing broker
    pub fn from_broker(broker: Arc<Broker>) -> Self {
        Self { broker }
    }

    /// Access the underlying broker for administrative operations
    /// (pause/unpause, queue removal, server roster)
    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Enqueue a task according to its options: immediately, at its
    /// process-at time, or into its aggregation group.
    ///
    /// Fails with [`Error::TaskIdConflict`] when the id is taken and
    /// [`Error::DuplicateUnique`] when another task holds the unique key.
    pub async fn enqueue(&self, task: Task) -> Result<TaskInfo> {
        let opts = task.options().clone();
        let now = Utc::now();

        if task.task_type().trim().is_empty() {
            return Err(Error::invalid_argument("task type must not be empty"));
        }
        let queue = match opts.queue {
            Some(name) => validate_queue_name(name)?,
            None => DEFAULT_QUEUE.to_string(),
        };
        let id = match opts.task_id {
            Some(id) if id.trim().is_empty() => {
                return Err(Error::invalid_argument("task id must not be empty"))
            }
            Some(id) => id,
            None => new_task_id(),
        };
        let unique_ttl = match opts.unique_ttl {
            Some(ttl) if ttl.as_secs() < 1 => {
                return Err(Error::invalid_argument(
                    "uniqueness TTL must be at least 1s",
                ))
            }
            Some(ttl) => Some(chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(1))),
            None => None,
        };
        let group = match opts.group {
            Some(g) if g.trim().is_empty() => {
                return Err(Error::invalid_argument("group name must not be empty"))
            }
            Some(g) => Some(g),
            None => None,
        };

        let unique_key = if unique_ttl.is_some() {
            let raw = opts
                .unique_key
                .unwrap_or_else(|| keys::unique_fingerprint(&queue, task.task_type(), task.payload()));
            keys::unique_key(&queue, &raw)
        } else {
            String::new()
        };

        let msg = TaskMessage {
            id,
            task_type: task.task_type().to_string(),
            payload: task.payload().to_vec(),
            queue,
            max_retry: opts.max_retry.unwrap_or(DEFAULT_MAX_RETRY),
            retried: 0,
            timeout: opts.timeout.map(|t| t.as_secs() as i64).unwrap_or(0),
            deadline: opts.deadline.map(|d| d.timestamp()).unwrap_or(0),
            unique_key,
            group_key: group.clone().unwrap_or_default(),
            retention: opts.retention.map(|r| r.as_secs() as i64).unwrap_or(0),
            completed_at: 0,
            last_err: String::new(),
            last_failed_at: 0,
        };

        let (state, next_process_at) = match opts.process_at {
            Some(at) if at > now => {
                match unique_ttl {
                    Some(ttl) => self.broker.schedule_unique(&msg, at, ttl).await?,
                    None => self.broker.schedule(&msg, at).await?,
                }
                (TaskState::Scheduled, Some(at))
            }
            _ => match group {
                Some(group) => {
                    match unique_ttl {
                        Some(ttl) => self.broker.add_to_group_unique(&msg, &group, ttl).await?,
                        None => self.broker.add_to_group(&msg, &group).await?,
                    }
                    (TaskState::Aggregating, None)
                }
                None => {
                    match unique_ttl {
                        Some(ttl) => self.broker.enqueue_unique(&msg, ttl).await?,
                        None => self.broker.enqueue(&msg).await?,
                    }
                    (TaskState::Pending, Some(now))
                }
            },
        };

        Ok(TaskInfo::from_message(msg, state, next_process_at, None))
    }

    /// Broadcast a cancellation event for an in-flight task. Servers not
    /// currently processing the id ignore it.
    pub async fn cancel(&self, task_id: &str) -> Result<()> {
        self.broker.publish_cancellation(task_id).await
    }

    /// Fetch the durable state of a task
    pub async fn get_task_info(&self, queue: &str, task_id: &str) -> Result<TaskInfo> {
        self.broker.get_task_info(queue, task_id).await
    }
}

fn validate_queue_name(name: String) -> Result<String> {
    if name.trim().is_empty() {
        return Err(Error::invalid_argument("queue name must not be empty"));
    }
    if name
        .chars()
        .any(|c| c == ':' || c == '{' || c == '}' || c.is_whitespace())
    {
        return Err(Error::invalid_argument(format!(
            "queue name contains reserved characters: {name}"
        )));
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_names_reject_reserved_characters() {
        assert!(validate_queue_name("default".into()).is_ok());
        assert!(validate_queue_name("low-priority_2".into()).is_ok());
        assert!(validate_queue_name("".into()).is_err());
        assert!(validate_queue_name("a:b".into()).is_err());
        assert!(validate_queue_name("a{b}".into()).is_err());
        assert!(validate_queue_name("a b".into()).is_err());
    }
}
