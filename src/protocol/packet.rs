//! Packet types and their binary body layout.
//!
//! Every packet is a [`Header`] followed by a body whose fields are written
//! in declaration order:
//!
//! | packet | body |
//! |---|---|
//! | ConnectionRequest | `[u16 len username][u16 len password]` |
//! | ConnectionResponse | `[present][code]` |
//! | Disconnect | empty |
//! | Push | `[u32 len queue][u64 id][u32 len payload][u64 timeout ms]` |
//! | TryPush | `[u32 len queue][u64 id][u32 len payload]` |
//! | PushResponse | `[u64 id][present][code]` |
//! | Pop | `[u32 len queue][u64 id][u64 timeout ms]` |
//! | TryPop | `[u32 len queue][u64 id]` |
//! | PopResponse | `[u64 id][present][code][u32 len payload]` |
//!
//! A timeout of `0` milliseconds means "wait forever".

use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

use super::wire_format::{Header, PacketType};
use crate::buffer::{LengthPrefix, SegmentedBuffer, WireCode};
use crate::error::{QueueWireError, Result};
use crate::writer::OutboundPacket;

/// Reason the broker refused a connection handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum ConnectionError {
    #[error("wrong credentials")]
    WrongCredentials,
    #[error("unknown error")]
    UnknownError,
}

/// Reason a push request failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum PushError {
    #[error("push timed out")]
    Timeout,
    #[error("queue is full")]
    QueueFull,
    #[error("connection closed")]
    ConnectionClosed,
}

/// Reason a pop request failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum PopError {
    #[error("pop timed out")]
    Timeout,
    #[error("queue is empty")]
    QueueEmpty,
    #[error("connection closed")]
    ConnectionClosed,
}

impl WireCode for ConnectionError {
    fn code(self) -> u8 {
        match self {
            ConnectionError::WrongCredentials => 0,
            ConnectionError::UnknownError => 1,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ConnectionError::WrongCredentials),
            1 => Some(ConnectionError::UnknownError),
            _ => None,
        }
    }
}

impl WireCode for PushError {
    fn code(self) -> u8 {
        match self {
            PushError::Timeout => 0,
            PushError::QueueFull => 1,
            PushError::ConnectionClosed => 2,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(PushError::Timeout),
            1 => Some(PushError::QueueFull),
            2 => Some(PushError::ConnectionClosed),
            _ => None,
        }
    }
}

impl WireCode for PopError {
    fn code(self) -> u8 {
        match self {
            PopError::Timeout => 0,
            PopError::QueueEmpty => 1,
            PopError::ConnectionClosed => 2,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(PopError::Timeout),
            1 => Some(PopError::QueueEmpty),
            2 => Some(PopError::ConnectionClosed),
            _ => None,
        }
    }
}

/// Convert an optional timeout to its wire form.
///
/// `None` maps to `0` (no timeout). A present timeout is rounded down to whole
/// milliseconds but never below 1, so it cannot turn into "wait forever".
pub fn timeout_to_millis(timeout: Option<Duration>) -> u64 {
    match timeout {
        None => 0,
        Some(timeout) => u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX).max(1),
    }
}

fn millis_to_timeout(millis: u64) -> Option<Duration> {
    (millis != 0).then(|| Duration::from_millis(millis))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub username: Bytes,
    pub password: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionResponse {
    pub failure: Option<ConnectionError>,
}

/// Blocking push: the response is sent once the payload is consumed or the
/// timeout elapses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushRequest {
    pub queue: String,
    pub id: u64,
    pub payload: Bytes,
    pub timeout_millis: u64,
}

impl PushRequest {
    /// The wait limit, `None` when the request never times out.
    pub fn timeout(&self) -> Option<Duration> {
        millis_to_timeout(self.timeout_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TryPushRequest {
    pub queue: String,
    pub id: u64,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushResponse {
    pub id: u64,
    pub failure: Option<PushError>,
}

/// Blocking pop: the response is sent once a payload is available or the
/// timeout elapses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PopRequest {
    pub queue: String,
    pub id: u64,
    pub timeout_millis: u64,
}

impl PopRequest {
    /// The wait limit, `None` when the request never times out.
    pub fn timeout(&self) -> Option<Duration> {
        millis_to_timeout(self.timeout_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TryPopRequest {
    pub queue: String,
    pub id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PopResponse {
    pub id: u64,
    pub failure: Option<PopError>,
    /// Empty whenever `failure` is set.
    pub payload: Bytes,
}

/// A decoded protocol packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    ConnectionRequest(ConnectionRequest),
    ConnectionResponse(ConnectionResponse),
    Disconnect,
    Push(PushRequest),
    TryPush(TryPushRequest),
    PushResponse(PushResponse),
    Pop(PopRequest),
    TryPop(TryPopRequest),
    PopResponse(PopResponse),
}

impl Packet {
    /// The packet kind written in the header.
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::ConnectionRequest(_) => PacketType::ConnectionRequest,
            Packet::ConnectionResponse(_) => PacketType::ConnectionResponse,
            Packet::Disconnect => PacketType::Disconnect,
            Packet::Push(_) => PacketType::Push,
            Packet::TryPush(_) => PacketType::TryPush,
            Packet::PushResponse(_) => PacketType::PushResponse,
            Packet::Pop(_) => PacketType::Pop,
            Packet::TryPop(_) => PacketType::TryPop,
            Packet::PopResponse(_) => PacketType::PopResponse,
        }
    }

    /// Write the body fields into `buf`.
    pub fn encode_body(&self, buf: &mut SegmentedBuffer) -> Result<()> {
        match self {
            Packet::ConnectionRequest(p) => {
                put_bytes(buf, &p.username, LengthPrefix::Two, "username")?;
                put_bytes(buf, &p.password, LengthPrefix::Two, "password")?;
            }
            Packet::ConnectionResponse(p) => {
                buf.append_optional(p.failure);
            }
            Packet::Disconnect => {}
            Packet::Push(p) => {
                put_queue(buf, &p.queue)?;
                buf.append_u64(p.id);
                put_bytes(buf, &p.payload, LengthPrefix::Four, "payload")?;
                buf.append_u64(p.timeout_millis);
            }
            Packet::TryPush(p) => {
                put_queue(buf, &p.queue)?;
                buf.append_u64(p.id);
                put_bytes(buf, &p.payload, LengthPrefix::Four, "payload")?;
            }
            Packet::PushResponse(p) => {
                buf.append_u64(p.id);
                buf.append_optional(p.failure);
            }
            Packet::Pop(p) => {
                put_queue(buf, &p.queue)?;
                buf.append_u64(p.id);
                buf.append_u64(p.timeout_millis);
            }
            Packet::TryPop(p) => {
                put_queue(buf, &p.queue)?;
                buf.append_u64(p.id);
            }
            Packet::PopResponse(p) => {
                buf.append_u64(p.id);
                buf.append_optional(p.failure);
                put_bytes(buf, &p.payload, LengthPrefix::Four, "payload")?;
            }
        }
        Ok(())
    }

    /// Read the body of a `packet_type` packet from `buf`.
    ///
    /// The caller checks that exactly the declared body length was consumed.
    pub fn decode_body(packet_type: PacketType, buf: &mut SegmentedBuffer) -> Result<Packet> {
        let packet = match packet_type {
            PacketType::ConnectionRequest => Packet::ConnectionRequest(ConnectionRequest {
                username: field(buf.read_bytes(LengthPrefix::Two), "username")?,
                password: field(buf.read_bytes(LengthPrefix::Two), "password")?,
            }),
            PacketType::ConnectionResponse => Packet::ConnectionResponse(ConnectionResponse {
                failure: field(buf.read_optional(), "failure")?,
            }),
            PacketType::Disconnect => Packet::Disconnect,
            PacketType::Push => Packet::Push(PushRequest {
                queue: field(buf.read_string(), "queue")?,
                id: field(buf.read_u64(), "id")?,
                payload: field(buf.read_bytes(LengthPrefix::Four), "payload")?,
                timeout_millis: field(buf.read_u64(), "timeout")?,
            }),
            PacketType::TryPush => Packet::TryPush(TryPushRequest {
                queue: field(buf.read_string(), "queue")?,
                id: field(buf.read_u64(), "id")?,
                payload: field(buf.read_bytes(LengthPrefix::Four), "payload")?,
            }),
            PacketType::PushResponse => Packet::PushResponse(PushResponse {
                id: field(buf.read_u64(), "id")?,
                failure: field(buf.read_optional(), "failure")?,
            }),
            PacketType::Pop => Packet::Pop(PopRequest {
                queue: field(buf.read_string(), "queue")?,
                id: field(buf.read_u64(), "id")?,
                timeout_millis: field(buf.read_u64(), "timeout")?,
            }),
            PacketType::TryPop => Packet::TryPop(TryPopRequest {
                queue: field(buf.read_string(), "queue")?,
                id: field(buf.read_u64(), "id")?,
            }),
            PacketType::PopResponse => Packet::PopResponse(PopResponse {
                id: field(buf.read_u64(), "id")?,
                failure: field(buf.read_optional(), "failure")?,
                payload: field(buf.read_bytes(LengthPrefix::Four), "payload")?,
            }),
        };
        Ok(packet)
    }

    /// Encode the packet into a header plus body chunks ready for the writer.
    ///
    /// # Example
    ///
    /// ```
    /// use queuewire::protocol::{Packet, HEADER_SIZE};
    ///
    /// let outbound = Packet::Disconnect.encode().unwrap();
    /// assert_eq!(outbound.size(), HEADER_SIZE);
    /// ```
    pub fn encode(&self) -> Result<OutboundPacket> {
        let mut body = SegmentedBuffer::new();
        self.encode_body(&mut body)?;
        let body_length = u32::try_from(body.len()).map_err(|_| {
            QueueWireError::Encode(format!("Body of {} bytes does not fit the header", body.len()))
        })?;
        let header = Header::new(self.packet_type(), body_length);
        Ok(OutboundPacket::new(&header, body.take_chunks()))
    }

    /// Encode the packet into one contiguous byte vector.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(self.encode()?.to_vec())
    }
}

fn field<T>(value: Option<T>, name: &str) -> Result<T> {
    value.ok_or_else(|| QueueWireError::Decode(format!("Missing or invalid field `{}`", name)))
}

fn put_bytes(
    buf: &mut SegmentedBuffer,
    data: &[u8],
    prefix: LengthPrefix,
    name: &str,
) -> Result<()> {
    buf.append_bytes(data, prefix).map(|_| ()).ok_or_else(|| {
        QueueWireError::Encode(format!("Field `{}` of {} bytes is too long", name, data.len()))
    })
}

fn put_queue(buf: &mut SegmentedBuffer, queue: &str) -> Result<()> {
    put_bytes(buf, queue.as_bytes(), LengthPrefix::Four, "queue")
}
