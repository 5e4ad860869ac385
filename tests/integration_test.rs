//! Integration tests against a local Redis instance (redis://127.0.0.1:6379).
//!
//! Every test works in its own randomly named queue, so the suite can run
//! in parallel and does not disturb other data in the database.

use dispatchq::broker::Broker;
use dispatchq::{
    Client, Error, Handler, ServeMux, Server, ServerConfig, Task, TaskContext, TaskState,
};
use rand::Rng as _;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const REDIS_URL: &str = "redis://127.0.0.1:6379";

async fn broker() -> Arc<Broker> {
    Arc::new(Broker::connect(REDIS_URL).await.expect("redis connection"))
}

fn qname() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(rand::distributions::Alphanumeric)
        .take(12)
        .map(char::from)
        .collect();
    format!("test-{suffix}")
}

#[tokio::test]
async fn enqueue_dequeue_done_lifecycle() {
    let broker = broker().await;
    let client = Client::from_broker(broker.clone());
    let queue = qname();

    let info = client
        .enqueue(Task::new("demo:work", b"payload".to_vec()).queue(queue.clone()))
        .await
        .expect("enqueue");
    assert_eq!(info.state, TaskState::Pending);

    let fetched = client.get_task_info(&queue, &info.id).await.expect("info");
    assert_eq!(fetched.state, TaskState::Pending);

    let (msg, lease_expiry) = broker
        .dequeue(&[queue.clone()], Duration::from_secs(30))
        .await
        .expect("dequeue")
        .expect("task available");
    assert_eq!(msg.id, info.id);
    assert_eq!(msg.payload, b"payload");
    assert!(lease_expiry > chrono::Utc::now());

    let fetched = client.get_task_info(&queue, &info.id).await.expect("info");
    assert_eq!(fetched.state, TaskState::Active);

    broker.done(&msg).await.expect("done");
    match client.get_task_info(&queue, &info.id).await {
        Err(Error::TaskNotFound { .. }) => {}
        other => panic!("expected TaskNotFound after done, got {other:?}"),
    }
}

#[tokio::test]
async fn task_id_conflict_is_rejected() {
    let client = Client::from_broker(broker().await);
    let queue = qname();

    let make = || {
        Task::new("demo:work", vec![])
            .queue(queue.clone())
            .task_id("fixed-id")
    };
    client.enqueue(make()).await.expect("first enqueue");
    match client.enqueue(make()).await {
        Err(Error::TaskIdConflict { id }) => assert_eq!(id, "fixed-id"),
        other => panic!("expected TaskIdConflict, got {other:?}"),
    }
}

#[tokio::test]
async fn unique_lock_rejects_duplicates_until_settled() {
    let broker = broker().await;
    let client = Client::from_broker(broker.clone());
    let queue = qname();

    let make = || {
        Task::new("billing:invoice", b"customer-1".to_vec())
            .queue(queue.clone())
            .unique(Duration::from_secs(60))
    };

    client.enqueue(make()).await.expect("first enqueue");
    match client.enqueue(make()).await {
        Err(Error::DuplicateUnique) => {}
        other => panic!("expected DuplicateUnique, got {other:?}"),
    }

    let (msg, _) = broker
        .dequeue(&[queue.clone()], Duration::from_secs(30))
        .await
        .expect("dequeue")
        .expect("task available");
    broker.done(&msg).await.expect("done");

    // the lock is released with the task, so the key is free again
    client.enqueue(make()).await.expect("enqueue after settle");
}

#[tokio::test]
async fn scheduled_task_promotes_only_after_process_at() {
    let broker = broker().await;
    let client = Client::from_broker(broker.clone());
    let queue = qname();

    let info = client
        .enqueue(
            Task::new("demo:later", vec![])
                .queue(queue.clone())
                .process_in(Duration::from_secs(1)),
        )
        .await
        .expect("enqueue");
    assert_eq!(info.state, TaskState::Scheduled);

    // not due yet: the forwarder must not promote it
    broker.forward(&queue).await.expect("forward");
    let fetched = client.get_task_info(&queue, &info.id).await.expect("info");
    assert_eq!(fetched.state, TaskState::Scheduled);
    assert!(broker
        .dequeue(&[queue.clone()], Duration::from_secs(30))
        .await
        .expect("dequeue")
        .is_none());

    tokio::time::sleep(Duration::from_millis(1200)).await;
    broker.forward(&queue).await.expect("forward");
    let fetched = client.get_task_info(&queue, &info.id).await.expect("info");
    assert_eq!(fetched.state, TaskState::Pending);

    let (msg, _) = broker
        .dequeue(&[queue.clone()], Duration::from_secs(30))
        .await
        .expect("dequeue")
        .expect("task due");
    assert_eq!(msg.id, info.id);
}

#[tokio::test]
async fn failed_task_retries_then_archives() {
    let broker = broker().await;
    let client = Client::from_broker(broker.clone());
    let queue = qname();

    let info = client
        .enqueue(
            Task::new("demo:flaky", vec![])
                .queue(queue.clone())
                .max_retry(2),
        )
        .await
        .expect("enqueue");

    // two failing attempts consume the retry budget
    for expected_retried in 1..=2u32 {
        let (msg, _) = broker
            .dequeue(&[queue.clone()], Duration::from_secs(30))
            .await
            .expect("dequeue")
            .expect("task available");
        broker
            .retry(&msg, chrono::Utc::now(), "handler failed", true)
            .await
            .expect("retry");

        let fetched = client.get_task_info(&queue, &info.id).await.expect("info");
        assert_eq!(fetched.state, TaskState::Retry);
        assert_eq!(fetched.retried, expected_retried);
        assert_eq!(fetched.last_err, "handler failed");

        broker.forward(&queue).await.expect("forward");
    }

    // third failure: retried == max_retry, the processor archives
    let (msg, _) = broker
        .dequeue(&[queue.clone()], Duration::from_secs(30))
        .await
        .expect("dequeue")
        .expect("task available");
    assert_eq!(msg.retried, msg.max_retry);
    broker.archive(&msg, "handler failed").await.expect("archive");

    let fetched = client.get_task_info(&queue, &info.id).await.expect("info");
    assert_eq!(fetched.state, TaskState::Archived);
    assert_eq!(fetched.retried, 2);
    assert_eq!(fetched.last_err, "handler failed");
}

#[tokio::test]
async fn expired_lease_recovers_to_head_of_pending() {
    let broker = broker().await;
    let client = Client::from_broker(broker.clone());
    let queue = qname();

    let first = client
        .enqueue(Task::new("demo:crash", vec![]).queue(queue.clone()))
        .await
        .expect("enqueue first");
    let _second = client
        .enqueue(Task::new("demo:other", vec![]).queue(queue.clone()))
        .await
        .expect("enqueue second");

    // a server takes the first task with a very short lease, then "crashes"
    let (msg, _) = broker
        .dequeue(&[queue.clone()], Duration::from_secs(1))
        .await
        .expect("dequeue")
        .expect("task available");
    assert_eq!(msg.id, first.id);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let expired = broker
        .list_lease_expired(&queue, chrono::Utc::now())
        .await
        .expect("list expired");
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].id, first.id);

    broker.requeue(&expired[0]).await.expect("requeue");

    // recovery preserves the retry counter and jumps the line
    let (recovered, _) = broker
        .dequeue(&[queue.clone()], Duration::from_secs(30))
        .await
        .expect("dequeue")
        .expect("task available");
    assert_eq!(recovered.id, first.id);
    assert_eq!(recovered.retried, msg.retried);
}

#[tokio::test]
async fn full_group_snapshots_into_an_aggregation_set() {
    let broker = broker().await;
    let client = Client::from_broker(broker.clone());
    let queue = qname();
    let group = "g1";

    for i in 0..2u8 {
        client
            .enqueue(
                Task::new("notify:send", vec![i])
                    .queue(queue.clone())
                    .group(group),
            )
            .await
            .expect("enqueue grouped");
    }

    let expiry = chrono::Utc::now() + chrono::Duration::seconds(120);
    // two members, grace period still running: no trigger
    let created = broker
        .aggregation_check(
            &queue,
            group,
            "set-early",
            3,
            Duration::ZERO,
            Duration::from_secs(10),
            expiry,
        )
        .await
        .expect("check");
    assert!(!created);

    client
        .enqueue(
            Task::new("notify:send", vec![2])
                .queue(queue.clone())
                .group(group),
        )
        .await
        .expect("enqueue third");

    // the third member reaches max_size
    let created = broker
        .aggregation_check(
            &queue,
            group,
            "set-full",
            3,
            Duration::ZERO,
            Duration::from_secs(10),
            expiry,
        )
        .await
        .expect("check");
    assert!(created);

    let members = broker
        .read_aggregation_set(&queue, group, "set-full")
        .await
        .expect("read set");
    assert_eq!(members.len(), 3);
    let payloads: Vec<u8> = members.iter().map(|m| m.payload[0]).collect();
    assert_eq!(payloads, vec![0, 1, 2]);

    // the originals left the group
    assert!(broker.list_groups(&queue).await.expect("groups").is_empty());

    broker
        .delete_aggregation_set(&queue, group, "set-full")
        .await
        .expect("delete set");
    for member in &members {
        match client.get_task_info(&queue, &member.id).await {
            Err(Error::TaskNotFound { .. }) => {}
            other => panic!("expected member deleted, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn paused_queue_yields_no_tasks() {
    let broker = broker().await;
    let client = Client::from_broker(broker.clone());
    let queue = qname();

    client
        .enqueue(Task::new("demo:work", vec![]).queue(queue.clone()))
        .await
        .expect("enqueue");

    broker.pause_queue(&queue).await.expect("pause");
    assert!(broker
        .dequeue(&[queue.clone()], Duration::from_secs(30))
        .await
        .expect("dequeue")
        .is_none());

    broker.unpause_queue(&queue).await.expect("unpause");
    assert!(broker
        .dequeue(&[queue.clone()], Duration::from_secs(30))
        .await
        .expect("dequeue")
        .is_some());
}

#[tokio::test]
async fn queue_removal_respects_emptiness() {
    let broker = broker().await;
    let client = Client::from_broker(broker.clone());
    let queue = qname();

    match broker.remove_queue("never-created-queue", false).await {
        Err(Error::QueueNotFound { .. }) => {}
        other => panic!("expected QueueNotFound, got {other:?}"),
    }

    client
        .enqueue(Task::new("demo:work", vec![]).queue(queue.clone()))
        .await
        .expect("enqueue");
    match broker.remove_queue(&queue, false).await {
        Err(Error::QueueNotEmpty { .. }) => {}
        other => panic!("expected QueueNotEmpty, got {other:?}"),
    }

    broker.remove_queue(&queue, true).await.expect("forced removal");
}

#[tokio::test]
async fn expired_completed_sweep_is_idempotent() {
    let broker = broker().await;
    let client = Client::from_broker(broker.clone());
    let queue = qname();

    let info = client
        .enqueue(
            Task::new("demo:retained", vec![])
                .queue(queue.clone())
                .retention(Duration::from_secs(1)),
        )
        .await
        .expect("enqueue");

    let (msg, _) = broker
        .dequeue(&[queue.clone()], Duration::from_secs(30))
        .await
        .expect("dequeue")
        .expect("task available");
    broker.mark_complete(&msg).await.expect("mark complete");

    let fetched = client.get_task_info(&queue, &info.id).await.expect("info");
    assert_eq!(fetched.state, TaskState::Completed);
    assert!(fetched.completed_at.is_some());

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let deleted = broker
        .delete_expired_completed(&queue, 100)
        .await
        .expect("sweep");
    assert_eq!(deleted, 1);

    // a second sweep with no other activity changes nothing
    let deleted = broker
        .delete_expired_completed(&queue, 100)
        .await
        .expect("sweep");
    assert_eq!(deleted, 0);
    match client.get_task_info(&queue, &info.id).await {
        Err(Error::TaskNotFound { .. }) => {}
        other => panic!("expected TaskNotFound after sweep, got {other:?}"),
    }
}

struct CountingHandler {
    processed: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl Handler for CountingHandler {
    async fn process_task(&self, _ctx: &TaskContext) -> anyhow::Result<()> {
        self.processed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn server_processes_enqueued_tasks_end_to_end() {
    let broker = broker().await;
    let client = Client::from_broker(broker.clone());
    let queue = qname();

    let mut ids = Vec::new();
    for i in 0..5u8 {
        let info = client
            .enqueue(Task::new("count:item", vec![i]).queue(queue.clone()))
            .await
            .expect("enqueue");
        ids.push(info.id);
    }

    let processed = Arc::new(AtomicUsize::new(0));
    let mux = ServeMux::new();
    mux.register(
        "count:",
        CountingHandler {
            processed: processed.clone(),
        },
    )
    .await;

    let config = ServerConfig {
        concurrency: 2,
        queues: HashMap::from([(queue.clone(), 1)]),
        ..Default::default()
    };
    let server = Server::new(broker.clone(), config).expect("server");
    server.start(mux).await.expect("start");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while processed.load(Ordering::SeqCst) < 5 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    server.shutdown().await;

    assert_eq!(processed.load(Ordering::SeqCst), 5);
    for id in ids {
        match client.get_task_info(&queue, &id).await {
            Err(Error::TaskNotFound { .. }) => {}
            other => panic!("expected task {id} settled and deleted, got {other:?}"),
        }
    }
}
