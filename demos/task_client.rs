//! Task client example
//!
//! Demonstrates the enqueue options: immediate, delayed, unique, grouped,
//! and retained tasks, plus inspection and cancellation.
//!
//! To run this example:
//! 1. Make sure Redis is running on localhost:6379
//! 2. Run: cargo run --example task_client

use dispatchq::{Client, Error, Task};
use std::time::Duration;
use tracing::{info, warn, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let client = Client::connect("redis://127.0.0.1:6379").await?;

    // An ordinary task, retried up to 3 times
    let info = client
        .enqueue(Task::new("email:deliver", b"user@example.com".to_vec()).max_retry(3))
        .await?;
    info!("enqueued {} (state: {})", info.id, info.state);

    // A delayed task: runs no earlier than 30 seconds from now
    let info = client
        .enqueue(
            Task::new("report:generate", b"monthly".to_vec())
                .process_in(Duration::from_secs(30)),
        )
        .await?;
    info!(
        "scheduled {} for {:?}",
        info.id,
        info.next_process_at.map(|t| t.to_rfc3339())
    );

    // A unique task: the second enqueue is rejected while the first is in
    // flight
    let unique = || {
        Task::new("billing:invoice", b"customer-42".to_vec())
            .unique(Duration::from_secs(60))
    };
    client.enqueue(unique()).await?;
    match client.enqueue(unique()).await {
        Err(Error::DuplicateUnique) => info!("duplicate invoice rejected as expected"),
        other => warn!("unexpected outcome for duplicate enqueue: {other:?}"),
    }

    // Grouped tasks aggregate into one batch on the server side
    for i in 0..3 {
        let info = client
            .enqueue(
                Task::new("notification:send", format!("event-{i}").into_bytes())
                    .group("user-7"),
            )
            .await?;
        info!("added {} to group user-7", info.id);
    }

    // A retained task keeps its record (and handler result) for an hour
    let info = client
        .enqueue(
            Task::new("export:csv", b"orders".to_vec())
                .retention(Duration::from_secs(3600))
                .timeout(Duration::from_secs(120)),
        )
        .await?;

    // Inspect it
    let fetched = client.get_task_info(&info.queue, &info.id).await?;
    info!(
        "task {} is {} in queue {} (retried {}/{})",
        fetched.id, fetched.state, fetched.queue, fetched.retried, fetched.max_retry
    );

    // Cancellation is a broadcast; servers not running the task ignore it
    client.cancel(&info.id).await?;
    info!("cancellation published for {}", info.id);

    Ok(())
}
