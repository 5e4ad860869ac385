//! Aggregator: batches grouped tasks into single combined tasks

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::task::{new_task_id, Task, TaskMessage, DEFAULT_MAX_RETRY};

use super::Inner;

const CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// An aggregation set not consumed within this window is considered
/// abandoned; the janitor returns its members to their group
const AGGREGATION_TIMEOUT: Duration = Duration::from_secs(2 * 60);

pub(crate) async fn run(inner: Arc<Inner>) {
    let aggregator = match &inner.config.group_aggregator {
        Some(aggregator) => aggregator.clone(),
        None => return,
    };
    let mut shutdown = inner.shutdown_tx.subscribe();
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!("aggregator started");

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }
        for queue in inner.queue_names() {
            let groups = match inner.broker.list_groups(&queue).await {
                Ok(groups) => groups,
                Err(err) => {
                    warn!(queue = %queue, error = %err, "failed to list groups");
                    continue;
                }
            };
            for group in groups {
                let set_id = Uuid::new_v4().to_string();
                let created = inner
                    .broker
                    .aggregation_check(
                        &queue,
                        &group,
                        &set_id,
                        inner.config.group_max_size,
                        inner.config.group_max_delay,
                        inner.config.group_grace_period,
                        Utc::now()
                            + chrono::Duration::from_std(AGGREGATION_TIMEOUT)
                                .unwrap_or_else(|_| chrono::Duration::seconds(120)),
                    )
                    .await;
                match created {
                    Ok(true) => {
                        if let Err(err) =
                            aggregate(&inner, &*aggregator, &queue, &group, &set_id).await
                        {
                            // the set stays behind; the janitor reclaims it
                            // after the aggregation timeout
                            warn!(
                                queue = %queue,
                                group = %group,
                                error = %err,
                                "aggregation failed"
                            );
                        }
                    }
                    Ok(false) => {}
                    Err(err) => {
                        warn!(queue = %queue, group = %group, error = %err, "aggregation check failed")
                    }
                }
            }
        }
    }
    info!("aggregator stopped");
}

async fn aggregate(
    inner: &Arc<Inner>,
    aggregator: &dyn super::GroupAggregator,
    queue: &str,
    group: &str,
    set_id: &str,
) -> Result<()> {
    let msgs = inner.broker.read_aggregation_set(queue, group, set_id).await?;
    if msgs.is_empty() {
        return inner.broker.delete_aggregation_set(queue, group, set_id).await;
    }
    let size = msgs.len();
    let tasks: Vec<Task> = msgs
        .iter()
        .map(|msg| Task::new(msg.task_type.clone(), msg.payload.clone()))
        .collect();

    let combined = aggregator.aggregate(group, tasks);
    let opts = combined.options().clone();
    // the combined task always enters pending of the same queue; its own
    // group option is ignored so batches never re-aggregate
    let msg = TaskMessage {
        id: opts.task_id.unwrap_or_else(new_task_id),
        task_type: combined.task_type().to_string(),
        payload: combined.payload().to_vec(),
        queue: queue.to_string(),
        max_retry: opts.max_retry.unwrap_or(DEFAULT_MAX_RETRY),
        retried: 0,
        timeout: opts.timeout.map(|t| t.as_secs() as i64).unwrap_or(0),
        deadline: opts.deadline.map(|d| d.timestamp()).unwrap_or(0),
        unique_key: String::new(),
        group_key: String::new(),
        retention: opts.retention.map(|r| r.as_secs() as i64).unwrap_or(0),
        completed_at: 0,
        last_err: String::new(),
        last_failed_at: 0,
    };
    inner.broker.enqueue(&msg).await?;
    inner.broker.delete_aggregation_set(queue, group, set_id).await?;
    info!(
        queue = %queue,
        group = %group,
        size,
        id = %msg.id,
        "aggregated group into a single task"
    );
    Ok(())
}
