//! Transport module - TCP socket handling for broker and clients.

mod tcp;

pub use tcp::{connect, TcpTransportListener};
