//! Producer - pushes typed jobs to a queue.
//!
//! This example demonstrates:
//! - Connecting an `AsyncClient` to a running broker
//! - Pushing MessagePack-encoded values with `push_value`
//! - Waiting until a consumer takes each job, with a timeout
//!
//! # Running
//!
//! ```text
//! cargo run --bin queuewire-broker -- --port 25565
//! cargo run --example producer -- 127.0.0.1:25565 10
//! ```

use std::time::Duration;

use queuewire::AsyncClient;
use serde::Serialize;

/// A unit of work for the consumer.
#[derive(Serialize, Debug)]
struct Job {
    id: u32,
    url: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().init();

    let mut args = std::env::args().skip(1);
    let addr = args.next().unwrap_or_else(|| "127.0.0.1:25565".to_string());
    let count: u32 = args.next().map(|n| n.parse()).transpose()?.unwrap_or(10);

    let client = AsyncClient::connect(addr.as_str(), "queuewire", "queuewire").await?;

    for id in 0..count {
        let job = Job {
            id,
            url: format!("https://example.com/images/{}.png", id),
        };
        client
            .push_value("jobs", &job, Some(Duration::from_secs(5)))
            .await?;
        println!("pushed {:?}", job);
    }

    client.shutdown().await;
    Ok(())
}
