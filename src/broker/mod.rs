//! Broker module - connection handling, authentication, and dispatch to queues.

mod dispatch;
mod server;

pub use dispatch::{BrokerCore, Credentials};
pub use server::Broker;
