//! Consumer - pops jobs with the callback client.
//!
//! This example demonstrates:
//! - Driving a `Client` by hand with `update()`
//! - Blocking pops with a timeout
//! - Decoding payloads with `MsgPackCodec`
//!
//! Stops after the queue stays empty for five seconds.
//!
//! # Running
//!
//! ```text
//! cargo run --example consumer -- 127.0.0.1:25565
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use queuewire::codec::MsgPackCodec;
use queuewire::error::QueueWireError;
use queuewire::protocol::PopError;
use queuewire::Client;
use serde::Deserialize;

#[derive(Deserialize, Debug)]
struct Job {
    id: u32,
    url: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:25565".to_string());
    let mut client = Client::connect(addr.as_str(), "queuewire", "queuewire").await?;

    let idle = Arc::new(AtomicBool::new(false));
    while !idle.load(Ordering::Acquire) {
        let idle = idle.clone();
        client.pop("jobs", Some(Duration::from_secs(5)), move |result| match result {
            Ok(payload) => match MsgPackCodec::decode::<Job>(&payload) {
                Ok(job) => println!("job {} -> {}", job.id, job.url),
                Err(e) => eprintln!("undecodable job: {}", e),
            },
            Err(QueueWireError::Pop(PopError::Timeout)) => idle.store(true, Ordering::Release),
            Err(e) => {
                eprintln!("pop failed: {}", e);
                idle.store(true, Ordering::Release);
            }
        });

        while client.pending_requests() > 0 {
            client.update().await?;
        }
    }

    client.disconnect().await?;
    Ok(())
}
