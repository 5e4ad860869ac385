//! Periodic tasks example
//!
//! Runs a manager that enqueues tasks on cron schedules fetched from a
//! provider. Run several copies against one Redis: each fire is enqueued
//! exactly once thanks to the per-fire uniqueness lock.
//!
//! To run this example:
//! 1. Make sure Redis is running on localhost:6379
//! 2. Run: cargo run --example periodic_tasks

use dispatchq::{
    Client, PeriodicTaskConfig, PeriodicTaskConfigProvider, PeriodicTaskManager, Result, Task,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};

/// A static provider; real deployments typically read a config file or a
/// database table here
struct StaticProvider;

#[async_trait::async_trait]
impl PeriodicTaskConfigProvider for StaticProvider {
    async fn get_configs(&self) -> Result<Vec<PeriodicTaskConfig>> {
        Ok(vec![
            // every 15 seconds
            PeriodicTaskConfig::new(
                "*/15 * * * * *",
                Task::new("metrics:rollup", b"1m".to_vec()),
            ),
            // top of every minute, into a dedicated queue
            PeriodicTaskConfig::new(
                "0 * * * * *",
                Task::new("report:heartbeat", vec![]).queue("reports"),
            ),
        ])
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let client = Client::connect("redis://127.0.0.1:6379").await?;
    let manager = Arc::new(PeriodicTaskManager::with_sync_interval(
        client,
        Arc::new(StaticProvider),
        Duration::from_secs(60),
    ));

    info!("running periodic task manager for 2 minutes...");
    let runner = manager.clone();
    let handle = tokio::spawn(async move { runner.run().await });

    tokio::time::sleep(Duration::from_secs(120)).await;
    manager.shutdown();
    handle.await??;

    info!("done");
    Ok(())
}
