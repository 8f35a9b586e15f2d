//! Queue client.
//!
//! [`Client`] binds a [`ProtocolEngine`] to a byte stream. Requests take a
//! completion callback and return immediately; the callback runs inside
//! [`Client::update`] once the broker answers. The caller decides when to
//! pump, which keeps the client usable from a plain loop without extra tasks.
//!
//! [`AsyncClient`] moves the same client onto a dedicated task and exposes
//! each request as a future.
//!
//! # Example
//!
//! ```ignore
//! use queuewire::Client;
//!
//! let mut client = Client::connect("127.0.0.1:25565", "queuewire", "queuewire").await?;
//! client.try_push("jobs", "resize:42", |result| {
//!     if let Err(e) = result {
//!         eprintln!("push failed: {}", e);
//!     }
//! });
//! while client.pending_requests() > 0 {
//!     client.update().await?;
//! }
//! client.disconnect().await?;
//! ```

mod async_client;
mod engine;

pub use async_client::AsyncClient;
pub use engine::{Outgoing, PopCallback, ProtocolEngine, PushCallback};

use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::error::{QueueWireError, Result};
use crate::protocol::PacketDecoder;
use crate::writer::{spawn_writer_task, WriterHandle};

/// A connection to a broker, pumped by the caller.
pub struct Client<S = TcpStream> {
    engine: ProtocolEngine,
    reader: ReadHalf<S>,
    writer: WriterHandle,
    writer_task: JoinHandle<Result<()>>,
    read_buf: Vec<u8>,
}

impl Client<TcpStream> {
    /// Connect with default settings and wait for the broker to accept the
    /// credentials.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        username: impl AsRef<[u8]>,
        password: impl AsRef<[u8]>,
    ) -> Result<Self> {
        Self::connect_with_config(addr, username, password, &ClientConfig::default()).await
    }

    /// Connect and wait for the broker to accept the credentials.
    ///
    /// A broker closes the connection on wrong credentials, so a refused
    /// login shows up as `ConnectionClosed`.
    pub async fn connect_with_config(
        addr: impl ToSocketAddrs,
        username: impl AsRef<[u8]>,
        password: impl AsRef<[u8]>,
        config: &ClientConfig,
    ) -> Result<Self> {
        let stream =
            crate::transport::connect(addr, config.connect_timeout(), config.nodelay).await?;
        let mut client = Self::from_stream(stream, username, password, config)?;

        tokio::time::timeout(config.connect_timeout(), client.authorize())
            .await
            .map_err(|_| QueueWireError::Timeout)??;
        Ok(client)
    }
}

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wrap an established stream and queue the login packet.
    ///
    /// Does not wait for the broker's answer; see [`authorize`](Self::authorize).
    pub fn from_stream(
        stream: S,
        username: impl AsRef<[u8]>,
        password: impl AsRef<[u8]>,
        config: &ClientConfig,
    ) -> Result<Self> {
        let (reader, writer) = tokio::io::split(stream);
        let (writer, writer_task) = spawn_writer_task(writer, &config.writer);
        let engine = ProtocolEngine::with_decoder(PacketDecoder::with_max_body(config.max_body_size));

        writer.try_send(engine.connection_request(username.as_ref(), password.as_ref())?)?;

        Ok(Self {
            engine,
            reader,
            writer,
            writer_task,
            read_buf: vec![0u8; config.read_buffer_size.max(1)],
        })
    }

    /// Pump until the broker accepts the login.
    pub async fn authorize(&mut self) -> Result<()> {
        while !self.engine.is_authorized() {
            self.update().await?;
        }
        Ok(())
    }

    /// Push `payload` to `queue`; `callback` fires once a consumer takes it.
    ///
    /// `None` waits until the payload is consumed or the connection closes.
    pub fn push<F>(
        &mut self,
        queue: &str,
        payload: impl Into<Bytes>,
        timeout: Option<Duration>,
        callback: F,
    ) where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let outgoing = self
            .engine
            .push(queue, payload.into(), timeout, Box::new(callback));
        self.send(outgoing);
    }

    /// Buffer `payload` in `queue` without waiting for a consumer.
    pub fn try_push<F>(&mut self, queue: &str, payload: impl Into<Bytes>, callback: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let outgoing = self
            .engine
            .try_push(queue, payload.into(), Box::new(callback));
        self.send(outgoing);
    }

    /// Pop from `queue`, waiting up to `timeout` for a payload.
    pub fn pop<F>(&mut self, queue: &str, timeout: Option<Duration>, callback: F)
    where
        F: FnOnce(Result<Bytes>) + Send + 'static,
    {
        let outgoing = self.engine.pop(queue, timeout, Box::new(callback));
        self.send(outgoing);
    }

    /// Pop from `queue` only if a payload is buffered.
    pub fn try_pop<F>(&mut self, queue: &str, callback: F)
    where
        F: FnOnce(Result<Bytes>) + Send + 'static,
    {
        let outgoing = self.engine.try_pop(queue, Box::new(callback));
        self.send(outgoing);
    }

    fn send(&mut self, outgoing: Option<Outgoing>) {
        let Some(Outgoing { id, packet }) = outgoing else {
            return;
        };
        if let Err(e) = self.writer.try_send(packet) {
            tracing::debug!("Request {} not sent: {}", id, e);
            self.engine.fail_request(id, e);
        }
    }

    /// Wait for one read from the broker and run the completions it resolves.
    ///
    /// Cancel safe: dropping the future before it completes loses no data.
    /// Any error closes the client and fails every request in flight.
    pub async fn update(&mut self) -> Result<()> {
        if self.engine.is_closed() {
            return Err(QueueWireError::ConnectionClosed);
        }
        if self.writer.is_failed() {
            self.engine.close();
            return Err(QueueWireError::ConnectionClosed);
        }

        let n = match self.reader.read(&mut self.read_buf).await {
            Ok(0) => {
                tracing::debug!("Broker closed the connection");
                self.engine.close();
                return Err(QueueWireError::ConnectionClosed);
            }
            Ok(n) => n,
            Err(e) => {
                tracing::debug!("Read error: {}", e);
                self.engine.close();
                return Err(e.into());
            }
        };

        self.engine.handle_incoming(&self.read_buf[..n])
    }

    /// Process only data that is already available, without waiting.
    ///
    /// Returns whether anything was read.
    pub fn poll_update(&mut self) -> Result<bool> {
        let mut progressed = false;
        loop {
            match self.update().now_or_never() {
                Some(Ok(())) => progressed = true,
                Some(Err(e)) => return Err(e),
                None => return Ok(progressed),
            }
        }
    }

    /// Say goodbye to the broker and fail every request in flight.
    pub fn close(&mut self) {
        if self.engine.is_closed() {
            return;
        }
        match self.engine.disconnect_packet() {
            Ok(packet) => {
                if let Err(e) = self.writer.try_send(packet) {
                    tracing::debug!("Disconnect not sent: {}", e);
                }
            }
            Err(e) => tracing::debug!("Disconnect not encoded: {}", e),
        }
        self.engine.close();
    }

    /// Close and wait until everything queued has been written.
    pub async fn disconnect(mut self) -> Result<()> {
        self.close();
        let Self {
            writer,
            writer_task,
            ..
        } = self;
        drop(writer);

        match writer_task.await {
            Ok(result) => result,
            Err(e) => {
                tracing::debug!("Writer task ended abnormally: {}", e);
                Err(QueueWireError::ConnectionClosed)
            }
        }
    }

    /// Check if the broker accepted the login.
    pub fn is_authorized(&self) -> bool {
        self.engine.is_authorized()
    }

    pub fn is_closed(&self) -> bool {
        self.engine.is_closed()
    }

    /// Number of requests waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.engine.pending_requests()
    }
}
