//! Future-based client running on its own pump task.
//!
//! The pump task owns the [`Client`]. Each call on [`AsyncClient`] is sent
//! to the task as a command and answered over a oneshot channel, so the
//! client is only ever touched by one task. Between commands the task keeps
//! calling [`Client::update`].
//!
//! # Example
//!
//! ```ignore
//! use queuewire::AsyncClient;
//! use std::time::Duration;
//!
//! let client = AsyncClient::connect("127.0.0.1:25565", "queuewire", "queuewire").await?;
//! client.try_push("jobs", "resize:42").await?;
//! let payload = client.pop("jobs", Some(Duration::from_secs(5))).await?;
//! client.shutdown().await;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;

use super::Client;
use crate::codec::MsgPackCodec;
use crate::config::ClientConfig;
use crate::error::{QueueWireError, Result};

type Command<S> = Box<dyn FnOnce(&mut Client<S>) + Send>;

/// What woke the pump task.
enum Step<S> {
    Stop,
    Command(Command<S>),
    Updated(Result<()>),
}

/// A queue client whose requests are futures.
///
/// Dropping it stops the pump task, which sends a disconnect to the broker.
pub struct AsyncClient<S = TcpStream> {
    commands: mpsc::UnboundedSender<Command<S>>,
    running: Arc<AtomicBool>,
    notify: Arc<Notify>,
    pump: Option<JoinHandle<()>>,
}

impl AsyncClient<TcpStream> {
    /// Connect with default settings.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        username: impl AsRef<[u8]>,
        password: impl AsRef<[u8]>,
    ) -> Result<Self> {
        Self::connect_with_config(addr, username, password, &ClientConfig::default()).await
    }

    pub async fn connect_with_config(
        addr: impl ToSocketAddrs,
        username: impl AsRef<[u8]>,
        password: impl AsRef<[u8]>,
        config: &ClientConfig,
    ) -> Result<Self> {
        let client = Client::connect_with_config(addr, username, password, config).await?;
        Ok(Self::from_client(client))
    }
}

impl<S> AsyncClient<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Move `client` onto a new pump task.
    pub fn from_client(client: Client<S>) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let running = Arc::new(AtomicBool::new(true));
        let notify = Arc::new(Notify::new());

        let pump = tokio::spawn(pump_loop(client, rx, running.clone(), notify.clone()));

        Self {
            commands,
            running,
            notify,
            pump: Some(pump),
        }
    }

    /// Push `payload` to `queue` and wait until a consumer takes it.
    ///
    /// Fails with `Timeout` if nobody does within `timeout`, and with
    /// `QueueFull` right away if the payload does not fit.
    pub async fn push(
        &self,
        queue: impl Into<String>,
        payload: impl Into<Bytes>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let queue = queue.into();
        let payload = payload.into();
        self.request(move |client, done| client.push(&queue, payload, timeout, done))
            .await
    }

    /// Buffer `payload` in `queue` without waiting for a consumer.
    pub async fn try_push(&self, queue: impl Into<String>, payload: impl Into<Bytes>) -> Result<()> {
        let queue = queue.into();
        let payload = payload.into();
        self.request(move |client, done| client.try_push(&queue, payload, done))
            .await
    }

    /// Pop from `queue`, waiting up to `timeout` for a payload.
    pub async fn pop(&self, queue: impl Into<String>, timeout: Option<Duration>) -> Result<Bytes> {
        let queue = queue.into();
        self.request(move |client, done| client.pop(&queue, timeout, done))
            .await
    }

    /// Pop from `queue` only if a payload is buffered.
    pub async fn try_pop(&self, queue: impl Into<String>) -> Result<Bytes> {
        let queue = queue.into();
        self.request(move |client, done| client.try_pop(&queue, done))
            .await
    }

    /// Push a MessagePack-encoded value.
    pub async fn push_value<T: Serialize + ?Sized>(
        &self,
        queue: impl Into<String>,
        value: &T,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let payload = MsgPackCodec::encode(value)?;
        self.push(queue, payload, timeout).await
    }

    /// Pop a payload and decode it from MessagePack.
    pub async fn pop_value<T: DeserializeOwned>(
        &self,
        queue: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Result<T> {
        let payload = self.pop(queue, timeout).await?;
        MsgPackCodec::decode(&payload)
    }

    /// Run `issue` on the pump task and wait for the callback it registers.
    async fn request<T, F>(&self, issue: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Client<S>, Box<dyn FnOnce(Result<T>) + Send>) + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let done: Box<dyn FnOnce(Result<T>) + Send> = Box::new(move |result| {
            let _ = tx.send(result);
        });

        self.commands
            .send(Box::new(move |client: &mut Client<S>| issue(client, done)))
            .map_err(|_| QueueWireError::ConnectionClosed)?;

        rx.await.map_err(|_| QueueWireError::ConnectionClosed)?
    }

    /// Check if the pump task is still serving requests.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop the pump task and wait for it to disconnect.
    pub async fn shutdown(mut self) {
        self.stop();
        if let Some(pump) = self.pump.take() {
            if let Err(e) = pump.await {
                tracing::debug!("Pump task ended abnormally: {}", e);
            }
        }
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.notify.notify_one();
    }
}

impl<S> Drop for AsyncClient<S> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        self.notify.notify_one();
    }
}

async fn pump_loop<S>(
    mut client: Client<S>,
    mut commands: mpsc::UnboundedReceiver<Command<S>>,
    running: Arc<AtomicBool>,
    notify: Arc<Notify>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    while running.load(Ordering::Acquire) {
        let step = tokio::select! {
            biased;
            _ = notify.notified() => Step::Stop,
            command = commands.recv() => match command {
                Some(command) => Step::Command(command),
                None => Step::Stop,
            },
            result = client.update(), if !client.is_closed() => Step::Updated(result),
        };

        match step {
            Step::Stop => break,
            Step::Command(command) => command(&mut client),
            Step::Updated(Ok(())) => {}
            Step::Updated(Err(e)) => tracing::debug!("Client connection ended: {}", e),
        }
    }

    running.store(false, Ordering::Release);
    if let Err(e) = client.disconnect().await {
        tracing::debug!("Disconnect failed: {}", e);
    }
}
