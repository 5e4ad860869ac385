//! Simple worker example
//!
//! This example demonstrates how to:
//! 1. Define task handlers
//! 2. Register them on a mux
//! 3. Run a server processing tasks from the queue
//!
//! To run this example:
//! 1. Make sure Redis is running on localhost:6379
//! 2. Run: cargo run --example simple_worker

use dispatchq::{Client, Handler, ServeMux, Server, ServerConfig, Task, TaskContext};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, Level};

/// Payload for a simple math task
#[derive(Debug, Serialize, Deserialize)]
struct AddPayload {
    a: i32,
    b: i32,
}

struct AddHandler;

#[async_trait::async_trait]
impl Handler for AddHandler {
    async fn process_task(&self, ctx: &TaskContext) -> anyhow::Result<()> {
        let payload: AddPayload = serde_json::from_slice(&ctx.payload)?;
        // Simulate some work
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
        info!("adding {} + {} = {}", payload.a, payload.b, payload.a + payload.b);
        Ok(())
    }
}

/// Payload for a message-processing task
#[derive(Debug, Serialize, Deserialize)]
struct MessagePayload {
    message: String,
    uppercase: bool,
}

struct MessageHandler;

#[async_trait::async_trait]
impl Handler for MessageHandler {
    async fn process_task(&self, ctx: &TaskContext) -> anyhow::Result<()> {
        let payload: MessagePayload = serde_json::from_slice(&ctx.payload)?;
        tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;

        let result = if payload.uppercase {
            payload.message.to_uppercase()
        } else {
            payload.message.to_lowercase()
        };
        info!("processed message: '{}' -> '{}'", payload.message, result);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("starting simple worker example");

    let client = Client::connect("redis://127.0.0.1:6379").await?;

    info!("submitting test tasks...");

    // Submit some math tasks to a dedicated queue
    for i in 0..5 {
        let payload = serde_json::to_vec(&AddPayload { a: i, b: i * 2 })?;
        let task_info = client
            .enqueue(Task::new("math:add", payload).queue("math"))
            .await?;
        info!("submitted math:add task {}", task_info.id);
    }

    // Submit some message tasks to the default queue
    let messages = vec![
        ("Hello World", true),
        ("Rust is Amazing", false),
        ("Distributed Tasks", true),
    ];
    for (message, uppercase) in messages {
        let payload = serde_json::to_vec(&MessagePayload {
            message: message.to_string(),
            uppercase,
        })?;
        let task_info = client.enqueue(Task::new("message:process", payload)).await?;
        info!("submitted message:process task {}", task_info.id);
    }

    // Register handlers
    let mux = ServeMux::new();
    mux.register("math:add", AddHandler).await;
    mux.register("message:", MessageHandler).await;

    // The math queue is polled twice as often as default
    let config = ServerConfig {
        concurrency: 2,
        queues: HashMap::from([("math".to_string(), 2), ("default".to_string(), 1)]),
        ..Default::default()
    };

    info!("starting server... (ctrl-c to stop)");
    let server = Server::connect("redis://127.0.0.1:6379", config).await?;
    server.run(mux).await?;

    Ok(())
}
