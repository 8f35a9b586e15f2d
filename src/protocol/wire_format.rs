//! Wire format encoding and decoding.
//!
//! Implements the 5-byte packet header:
//! ```text
//! ┌──────────┬─────────────┐
//! │ Type tag │ Body length │
//! │ 1 byte   │ 4 bytes     │
//! │ uint8    │ uint32 LE   │
//! └──────────┴─────────────┘
//! ```
//!
//! All multi-byte integers are Little Endian.

use crate::error::{QueueWireError, Result};

/// Header size in bytes (fixed, exactly 5).
pub const HEADER_SIZE: usize = 5;

/// Default maximum body size (64 MiB).
pub const DEFAULT_MAX_BODY_SIZE: u32 = 64 * 1024 * 1024;

/// Packet kinds with their stable one-byte tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    ConnectionRequest = 0,
    ConnectionResponse = 1,
    Disconnect = 2,
    Push = 3,
    TryPush = 4,
    PushResponse = 5,
    Pop = 6,
    TryPop = 7,
    PopResponse = 8,
}

impl PacketType {
    /// Map a wire tag to a packet type, `None` for unknown tags.
    pub fn from_tag(tag: u8) -> Option<Self> {
        let packet_type = match tag {
            0 => PacketType::ConnectionRequest,
            1 => PacketType::ConnectionResponse,
            2 => PacketType::Disconnect,
            3 => PacketType::Push,
            4 => PacketType::TryPush,
            5 => PacketType::PushResponse,
            6 => PacketType::Pop,
            7 => PacketType::TryPop,
            8 => PacketType::PopResponse,
            _ => return None,
        };
        Some(packet_type)
    }

    /// The tag written on the wire.
    #[inline]
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Check if packets of this type travel from the broker to a client.
    #[inline]
    pub fn is_client_bound(self) -> bool {
        matches!(
            self,
            PacketType::ConnectionResponse | PacketType::PushResponse | PacketType::PopResponse
        )
    }
}

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Kind of the packet that follows.
    pub packet_type: PacketType,
    /// Body length in bytes.
    pub body_length: u32,
}

impl Header {
    /// Create a new header.
    pub fn new(packet_type: PacketType, body_length: u32) -> Self {
        Self {
            packet_type,
            body_length,
        }
    }

    /// Encode header to bytes (Little Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use queuewire::protocol::{Header, PacketType};
    ///
    /// let header = Header::new(PacketType::Push, 100);
    /// assert_eq!(header.encode(), [3, 100, 0, 0, 0]);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = self.packet_type.tag();
        buf[1..5].copy_from_slice(&self.body_length.to_le_bytes());
        buf
    }

    /// Decode header from bytes (Little Endian).
    ///
    /// Returns `Ok(None)` if the buffer is too short and a framing error for
    /// an unknown type tag.
    ///
    /// # Example
    ///
    /// ```
    /// use queuewire::protocol::{Header, PacketType};
    ///
    /// let header = Header::decode(&[6, 42, 0, 0, 0]).unwrap().unwrap();
    /// assert_eq!(header.packet_type, PacketType::Pop);
    /// assert_eq!(header.body_length, 42);
    /// ```
    pub fn decode(buf: &[u8]) -> Result<Option<Self>> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }
        let packet_type = PacketType::from_tag(buf[0]).ok_or_else(|| {
            QueueWireError::Framing(format!("Unknown packet type tag {}", buf[0]))
        })?;
        let body_length = u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]);
        Ok(Some(Self::new(packet_type, body_length)))
    }

    /// Validate the body length against the configured maximum.
    pub fn validate(&self, max_body_size: u32) -> Result<()> {
        if self.body_length > max_body_size {
            return Err(QueueWireError::Framing(format!(
                "Body size {} exceeds maximum {}",
                self.body_length, max_body_size
            )));
        }
        Ok(())
    }
}
