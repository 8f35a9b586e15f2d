//! # queuewire
//!
//! A networked FIFO message-queue broker and client over a compact binary
//! TCP protocol.
//!
//! Clients log in with a username and password, then push opaque payloads
//! to named queues and pop them back in order. Every queue has a byte
//! budget and rejects pushes that do not fit. A blocking `push` is answered
//! once a consumer takes the payload, a blocking `pop` once a payload
//! arrives; both can carry a timeout. `try_push` and `try_pop` answer
//! immediately.
//!
//! ## Architecture
//!
//! - **Broker**: one task owns every queue and client session; reader and
//!   writer tasks per connection only move bytes
//! - **Client**: a sans-IO protocol engine, pumped either by the caller
//!   ([`Client`]) or by a dedicated task ([`AsyncClient`])
//!
//! ## Example
//!
//! ```ignore
//! use queuewire::{AsyncClient, Broker, BrokerConfig};
//!
//! #[tokio::main]
//! async fn main() -> queuewire::Result<()> {
//!     let broker = Broker::bind(BrokerConfig::default().with_port(0)).await?;
//!     let addr = broker.local_addr()?;
//!     tokio::spawn(broker.run());
//!
//!     let client = AsyncClient::connect(addr, "queuewire", "queuewire").await?;
//!     client.try_push("jobs", "hello").await?;
//!     assert_eq!(client.pop("jobs", None).await?, "hello");
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod buffer;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod protocol;
pub mod queue;
pub mod transport;
pub mod writer;

pub use broker::Broker;
pub use client::{AsyncClient, Client};
pub use config::{BrokerConfig, ClientConfig};
pub use error::{QueueWireError, Result};
pub use protocol::Packet;
