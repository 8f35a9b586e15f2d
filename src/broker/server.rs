//! Broker server loop.
//!
//! One task owns the [`BrokerCore`]. Every accepted connection gets a reader
//! task, which forwards raw bytes to the loop, and a writer task, which sends
//! the responses. Queue state is never shared, so no locks are needed.
//!
//! # Example
//!
//! ```ignore
//! use queuewire::{Broker, BrokerConfig};
//!
//! let broker = Broker::bind(BrokerConfig::default()).await?;
//! broker.run_until(async { tokio::signal::ctrl_c().await.ok(); }).await?;
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::dispatch::BrokerCore;
use crate::config::BrokerConfig;
use crate::error::Result;
use crate::queue::ClientId;
use crate::transport::TcpTransportListener;
use crate::writer::spawn_writer_task;

/// Capacity of the channel from reader tasks to the broker loop.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Maximum connection events handled in one tick.
const MAX_EVENT_BATCH: usize = 256;

#[derive(Debug)]
enum ConnectionEvent {
    Data(ClientId, Bytes),
    Closed(ClientId),
}

/// A bound broker, ready to run.
pub struct Broker {
    config: BrokerConfig,
    listener: TcpTransportListener,
    core: BrokerCore,
    readers: HashMap<ClientId, JoinHandle<()>>,
}

impl Broker {
    /// Validate `config` and bind its address.
    pub async fn bind(config: BrokerConfig) -> Result<Self> {
        config.validate()?;
        let listener = TcpTransportListener::bind(config.bind_address(), config.nodelay).await?;
        tracing::info!("Broker listening on {}", listener.local_addr()?);

        Ok(Self {
            core: BrokerCore::new(&config),
            config,
            listener,
            readers: HashMap::new(),
        })
    }

    /// Get the bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until the process ends.
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` completes, then drop every connection.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let (events_tx, mut events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let mut sweep = tokio::time::interval(self.config.sweep_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Broker shutting down");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.add_connection(stream, peer, &events_tx),
                    Err(e) => tracing::warn!("Accept failed: {}", e),
                },
                Some(event) = events_rx.recv() => {
                    self.handle_event(event);
                    for _ in 1..MAX_EVENT_BATCH {
                        match events_rx.try_recv() {
                            Ok(event) => self.handle_event(event),
                            Err(_) => break,
                        }
                    }
                }
                _ = sweep.tick() => {
                    let expired = self.core.prune();
                    if expired > 0 {
                        tracing::trace!("Expired {} waiters", expired);
                    }
                }
            }

            for client in self.core.finish_tick() {
                if let Some(reader) = self.readers.remove(&client) {
                    reader.abort();
                }
                tracing::debug!("Client {} removed", client);
            }
        }

        for (_, reader) in self.readers.drain() {
            reader.abort();
        }
        Ok(())
    }

    fn add_connection(
        &mut self,
        stream: TcpStream,
        peer: SocketAddr,
        events: &mpsc::Sender<ConnectionEvent>,
    ) {
        let (read_half, write_half) = stream.into_split();
        let (writer, _writer_task) = spawn_writer_task(write_half, &self.config.writer);
        let client = self.core.register_client(writer);

        let reader = tokio::spawn(read_loop(
            client,
            read_half,
            events.clone(),
            self.config.read_buffer_size,
        ));
        self.readers.insert(client, reader);
        tracing::debug!("Client {} connected from {}", client, peer);
    }

    fn handle_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Data(client, data) => self.core.handle_data(client, &data),
            ConnectionEvent::Closed(client) => self.core.handle_closed(client),
        }
    }
}

/// Forward everything read from one connection to the broker loop.
async fn read_loop(
    client: ClientId,
    mut reader: OwnedReadHalf,
    events: mpsc::Sender<ConnectionEvent>,
    read_buffer_size: usize,
) {
    let mut buf = vec![0u8; read_buffer_size];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!("Read error on client {}: {}", client, e);
                break;
            }
        };

        let data = Bytes::copy_from_slice(&buf[..n]);
        if events.send(ConnectionEvent::Data(client, data)).await.is_err() {
            return;
        }
    }

    let _ = events.send(ConnectionEvent::Closed(client)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ConnectionRequest, ConnectionResponse, Packet, PacketDecoder};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_bind_rejects_invalid_config() {
        let config = BrokerConfig::default().with_port(0).with_host("");
        assert!(Broker::bind(config).await.is_err());
    }

    #[tokio::test]
    async fn test_login_over_tcp_and_shutdown() {
        let config = BrokerConfig::default()
            .with_host("127.0.0.1")
            .with_port(0)
            .with_credentials("u", "p");
        let broker = Broker::bind(config).await.unwrap();
        let addr = broker.local_addr().unwrap();

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(broker.run_until(async {
            let _ = stop_rx.await;
        }));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let login = Packet::ConnectionRequest(ConnectionRequest {
            username: Bytes::from_static(b"u"),
            password: Bytes::from_static(b"p"),
        });
        stream.write_all(&login.to_vec().unwrap()).await.unwrap();

        let mut decoder = PacketDecoder::new();
        let mut buf = [0u8; 64];
        let response = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                assert!(n > 0);
                if let Some(packet) = decoder.push(&buf[..n]).unwrap().pop() {
                    return packet;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(
            response,
            Packet::ConnectionResponse(ConnectionResponse { failure: None })
        );

        stop_tx.send(()).unwrap();
        assert!(server.await.unwrap().is_ok());
    }
}
