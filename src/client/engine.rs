//! Client-side protocol state, independent of sockets.
//!
//! [`ProtocolEngine`] assigns correlation ids, remembers the callback of
//! every request in flight and resolves it when the matching response is
//! decoded. The caller moves bytes: request methods hand back the encoded
//! packet to send, and [`handle_incoming`](ProtocolEngine::handle_incoming)
//! takes whatever was read from the socket.
//!
//! Every callback is invoked exactly once: with the response, with the
//! error that prevented sending, or with `ConnectionClosed` when the engine
//! closes.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;

use crate::error::{QueueWireError, Result};
use crate::protocol::{
    timeout_to_millis, ConnectionRequest, Packet, PacketDecoder, PopRequest, PushRequest,
    TryPopRequest, TryPushRequest,
};
use crate::writer::OutboundPacket;

/// Receives the outcome of a push request.
pub type PushCallback = Box<dyn FnOnce(Result<()>) + Send>;

/// Receives the outcome of a pop request.
pub type PopCallback = Box<dyn FnOnce(Result<Bytes>) + Send>;

/// An encoded request and the id it was registered under.
#[derive(Debug)]
pub struct Outgoing {
    pub id: u64,
    pub packet: OutboundPacket,
}

/// Correlation table and decoder for one broker connection.
pub struct ProtocolEngine {
    next_id: u64,
    pushes: HashMap<u64, PushCallback>,
    pops: HashMap<u64, PopCallback>,
    decoder: PacketDecoder,
    authorized: bool,
    closed: bool,
}

impl ProtocolEngine {
    pub fn new() -> Self {
        Self::with_decoder(PacketDecoder::new())
    }

    pub fn with_decoder(decoder: PacketDecoder) -> Self {
        Self {
            next_id: 1,
            pushes: HashMap::new(),
            pops: HashMap::new(),
            decoder,
            authorized: false,
            closed: false,
        }
    }

    /// Encode the handshake packet.
    pub fn connection_request(&self, username: &[u8], password: &[u8]) -> Result<OutboundPacket> {
        Packet::ConnectionRequest(ConnectionRequest {
            username: Bytes::copy_from_slice(username),
            password: Bytes::copy_from_slice(password),
        })
        .encode()
    }

    /// Encode the disconnect packet.
    pub fn disconnect_packet(&self) -> Result<OutboundPacket> {
        Packet::Disconnect.encode()
    }

    /// Register a blocking push.
    ///
    /// Returns `None` if the request could not be issued; `callback` has then
    /// already received the error.
    pub fn push(
        &mut self,
        queue: &str,
        payload: Bytes,
        timeout: Option<Duration>,
        callback: PushCallback,
    ) -> Option<Outgoing> {
        let timeout_millis = timeout_to_millis(timeout);
        self.register_push(callback, |id| {
            Packet::Push(PushRequest {
                queue: queue.to_string(),
                id,
                payload,
                timeout_millis,
            })
        })
    }

    /// Register a non-blocking push.
    pub fn try_push(&mut self, queue: &str, payload: Bytes, callback: PushCallback) -> Option<Outgoing> {
        self.register_push(callback, |id| {
            Packet::TryPush(TryPushRequest {
                queue: queue.to_string(),
                id,
                payload,
            })
        })
    }

    /// Register a blocking pop.
    pub fn pop(
        &mut self,
        queue: &str,
        timeout: Option<Duration>,
        callback: PopCallback,
    ) -> Option<Outgoing> {
        let timeout_millis = timeout_to_millis(timeout);
        self.register_pop(callback, |id| {
            Packet::Pop(PopRequest {
                queue: queue.to_string(),
                id,
                timeout_millis,
            })
        })
    }

    /// Register a non-blocking pop.
    pub fn try_pop(&mut self, queue: &str, callback: PopCallback) -> Option<Outgoing> {
        self.register_pop(callback, |id| {
            Packet::TryPop(TryPopRequest {
                queue: queue.to_string(),
                id,
            })
        })
    }

    fn register_push(
        &mut self,
        callback: PushCallback,
        build: impl FnOnce(u64) -> Packet,
    ) -> Option<Outgoing> {
        if self.closed {
            callback(Err(QueueWireError::ConnectionClosed));
            return None;
        }
        let id = self.allocate_id();
        match build(id).encode() {
            Ok(packet) => {
                self.pushes.insert(id, callback);
                Some(Outgoing { id, packet })
            }
            Err(e) => {
                callback(Err(e));
                None
            }
        }
    }

    fn register_pop(
        &mut self,
        callback: PopCallback,
        build: impl FnOnce(u64) -> Packet,
    ) -> Option<Outgoing> {
        if self.closed {
            callback(Err(QueueWireError::ConnectionClosed));
            return None;
        }
        let id = self.allocate_id();
        match build(id).encode() {
            Ok(packet) => {
                self.pops.insert(id, callback);
                Some(Outgoing { id, packet })
            }
            Err(e) => {
                callback(Err(e));
                None
            }
        }
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Fail the request `id` with `error`, e.g. when it could not be sent.
    pub fn fail_request(&mut self, id: u64, error: QueueWireError) {
        if let Some(callback) = self.pushes.remove(&id) {
            callback(Err(error));
        } else if let Some(callback) = self.pops.remove(&id) {
            callback(Err(error));
        }
    }

    /// Feed bytes read from the connection and resolve completed requests.
    ///
    /// A refused handshake returns `Connection(_)`, a protocol violation its
    /// framing or decode error; both close the engine.
    pub fn handle_incoming(&mut self, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(QueueWireError::ConnectionClosed);
        }
        self.decoder.append(data);

        loop {
            match self.decoder.next_packet() {
                Ok(Some(packet)) => self.handle_packet(packet)?,
                Ok(None) => return Ok(()),
                Err(e) => {
                    tracing::warn!("Broker sent an invalid packet: {}", e);
                    self.close();
                    return Err(e);
                }
            }
        }
    }

    fn handle_packet(&mut self, packet: Packet) -> Result<()> {
        match packet {
            Packet::ConnectionResponse(response) => match response.failure {
                None => self.authorized = true,
                Some(failure) => {
                    tracing::warn!("Broker refused the connection: {}", failure);
                    self.close();
                    return Err(QueueWireError::Connection(failure));
                }
            },
            Packet::PushResponse(response) => match self.pushes.remove(&response.id) {
                Some(callback) => callback(match response.failure {
                    None => Ok(()),
                    Some(failure) => Err(QueueWireError::Push(failure)),
                }),
                None => tracing::debug!("Push response for unknown id {}", response.id),
            },
            Packet::PopResponse(response) => match self.pops.remove(&response.id) {
                Some(callback) => callback(match response.failure {
                    None => Ok(response.payload),
                    Some(failure) => Err(QueueWireError::Pop(failure)),
                }),
                None => tracing::debug!("Pop response for unknown id {}", response.id),
            },
            Packet::Disconnect => {
                self.close();
                return Err(QueueWireError::ConnectionClosed);
            }
            other => {
                tracing::debug!("Ignoring broker-bound {:?}", other.packet_type());
            }
        }
        Ok(())
    }

    /// Fail every request in flight with `ConnectionClosed`.
    ///
    /// Requests issued afterwards fail immediately.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.decoder.clear();

        let mut pushes: Vec<_> = self.pushes.drain().collect();
        pushes.sort_by_key(|(id, _)| *id);
        for (_, callback) in pushes {
            callback(Err(QueueWireError::ConnectionClosed));
        }

        let mut pops: Vec<_> = self.pops.drain().collect();
        pops.sort_by_key(|(id, _)| *id);
        for (_, callback) in pops {
            callback(Err(QueueWireError::ConnectionClosed));
        }
    }

    /// Check if the broker accepted the handshake.
    pub fn is_authorized(&self) -> bool {
        self.authorized
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Number of requests waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.pushes.len() + self.pops.len()
    }
}

impl Default for ProtocolEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ProtocolEngine {
    fn drop(&mut self) {
        self.close();
    }
}
