//! # dispatchq
//!
//! A distributed task queue backed by a shared Redis instance.
//!
//! Clients enqueue typed tasks with options (retries, queues, deadlines,
//! delayed scheduling, uniqueness, grouping); servers pull tasks, invoke
//! registered handlers, and drive each task through its state machine until
//! it is completed, archived, or discarded. Every multi-key state transition
//! runs as an atomic Lua script, so any number of servers can share one
//! store with at-least-once delivery and exactly one in-flight execution per
//! task. Handlers should be idempotent.
//!
//! ## Features
//!
//! - At-least-once delivery with leases and crash recovery
//! - Priority-aware queue selection (strict or weighted)
//! - Delayed scheduling and per-task retry budgets
//! - Uniqueness locks for deduplication
//! - Task grouping with batch aggregation
//! - Cron-driven periodic tasks
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use dispatchq::{Client, Handler, ServeMux, Server, ServerConfig, Task, TaskContext};
//!
//! struct EmailHandler;
//!
//! #[async_trait::async_trait]
//! impl Handler for EmailHandler {
//!     async fn process_task(&self, ctx: &TaskContext) -> anyhow::Result<()> {
//!         println!("delivering email to {:?}", ctx.payload);
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = Client::connect("redis://127.0.0.1:6379").await?;
//!     client
//!         .enqueue(Task::new("email:deliver", b"user@example.com".to_vec()).max_retry(3))
//!         .await?;
//!
//!     let mux = ServeMux::new();
//!     mux.register("email:", EmailHandler).await;
//!
//!     let server = Server::connect("redis://127.0.0.1:6379", ServerConfig::default()).await?;
//!     server.run(mux).await?;
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod client;
pub mod error;
pub mod handler;
pub mod periodic;
pub mod server;
pub mod task;

// Re-export commonly used types
pub use broker::{Broker, ServerInfo, WorkerInfo};
pub use client::Client;
pub use error::{Error, Result};
pub use handler::{Handler, ServeMux, SkipRetry, TaskContext};
pub use periodic::{PeriodicTaskConfig, PeriodicTaskConfigProvider, PeriodicTaskManager};
pub use server::{GroupAggregator, Server, ServerConfig};
pub use task::{Task, TaskInfo, TaskState, DEFAULT_MAX_RETRY, DEFAULT_QUEUE};

/// Version of the dispatchq library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
