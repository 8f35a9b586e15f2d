//! Broker and client configuration.
//!
//! Both structs deserialize from JSON with every field optional, and offer
//! fluent setters in the style of a builder:
//!
//! ```
//! use queuewire::config::BrokerConfig;
//!
//! let config = BrokerConfig::default()
//!     .with_port(0)
//!     .with_credentials("alice", "secret")
//!     .with_max_queue_bytes(1024);
//! assert!(config.validate().is_ok());
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{QueueWireError, Result};
use crate::protocol::DEFAULT_MAX_BODY_SIZE;
use crate::queue::DEFAULT_MAX_QUEUE_BYTES;
use crate::writer::WriterConfig;

/// Default bind host.
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default broker port.
pub const DEFAULT_PORT: u16 = 25565;

/// Default username accepted by the broker.
pub const DEFAULT_USERNAME: &str = "queuewire";

/// Default password accepted by the broker.
pub const DEFAULT_PASSWORD: &str = "queuewire";

/// Default interval between timeout sweeps (1 s).
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 1000;

/// Default size of a single socket read (64 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Default client connect timeout (10 s).
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Broker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Byte limit of every queue.
    pub max_queue_bytes: usize,
    /// Interval between timeout sweeps, in milliseconds.
    pub sweep_interval_ms: u64,
    /// Largest packet body accepted from a client.
    pub max_body_size: u32,
    pub read_buffer_size: usize,
    /// Disable Nagle's algorithm on accepted sockets.
    pub nodelay: bool,
    pub writer: WriterConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            username: DEFAULT_USERNAME.to_string(),
            password: DEFAULT_PASSWORD.to_string(),
            max_queue_bytes: DEFAULT_MAX_QUEUE_BYTES,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            nodelay: true,
            writer: WriterConfig::default(),
        }
    }
}

impl BrokerConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON file; missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Check that every value is usable.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(QueueWireError::Config("host must not be empty".into()));
        }
        if self.sweep_interval_ms == 0 {
            return Err(QueueWireError::Config(
                "sweep_interval_ms must be greater than 0".into(),
            ));
        }
        if self.read_buffer_size == 0 {
            return Err(QueueWireError::Config(
                "read_buffer_size must be greater than 0".into(),
            ));
        }
        if self.username.len() > usize::from(u16::MAX) || self.password.len() > usize::from(u16::MAX)
        {
            return Err(QueueWireError::Config(
                "credentials must fit in 65535 bytes".into(),
            ));
        }
        if self.writer.channel_capacity == 0 || self.writer.max_pending_packets == 0 {
            return Err(QueueWireError::Config(
                "writer limits must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// The `host:port` address to bind.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the username and password clients must present.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Set the byte limit of every queue.
    ///
    /// Default: 4 MiB
    pub fn with_max_queue_bytes(mut self, max: usize) -> Self {
        self.max_queue_bytes = max;
        self
    }

    /// Set the timeout sweep interval.
    ///
    /// Default: 1 second
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the largest accepted packet body.
    ///
    /// Default: 64 MiB
    pub fn with_max_body_size(mut self, max: u32) -> Self {
        self.max_body_size = max;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn with_writer(mut self, writer: WriterConfig) -> Self {
        self.writer = writer;
        self
    }
}

/// Client connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Connect timeout, in milliseconds.
    pub connect_timeout_ms: u64,
    pub nodelay: bool,
    pub read_buffer_size: usize,
    /// Largest packet body accepted from the broker.
    pub max_body_size: u32,
    pub writer: WriterConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            nodelay: true,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            writer: WriterConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Set the connect timeout.
    ///
    /// Default: 10 seconds
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    pub fn with_writer(mut self, writer: WriterConfig) -> Self {
        self.writer = writer;
        self
    }
}
