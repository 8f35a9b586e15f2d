//! Incremental packet decoder for accumulating partial reads.
//!
//! Implements a state machine for handling fragmented packets:
//! - `AwaitingHeader`: Need at least 5 bytes
//! - `HaveHeader`: Header parsed, need `length` body bytes
//!
//! # Example
//!
//! ```
//! use queuewire::protocol::{Packet, PacketDecoder};
//!
//! let bytes = Packet::Disconnect.to_vec().unwrap();
//! let mut decoder = PacketDecoder::new();
//!
//! assert!(decoder.push(&bytes[..3]).unwrap().is_empty());
//! assert_eq!(decoder.push(&bytes[3..]).unwrap(), vec![Packet::Disconnect]);
//! ```

use super::packet::Packet;
use super::wire_format::{Header, PacketType, DEFAULT_MAX_BODY_SIZE, HEADER_SIZE};
use crate::buffer::SegmentedBuffer;
use crate::error::{QueueWireError, Result};

/// State machine for packet parsing.
#[derive(Debug, Clone, Copy)]
enum State {
    /// Waiting for a complete header (need 5 bytes).
    AwaitingHeader,
    /// Header parsed, waiting for the body.
    HaveHeader { packet_type: PacketType, length: u32 },
}

/// Buffer for accumulating incoming bytes and extracting complete packets.
#[derive(Debug)]
pub struct PacketDecoder {
    /// Accumulated bytes from socket reads.
    buffer: SegmentedBuffer,
    /// Current parsing state.
    state: State,
    /// Maximum allowed body size.
    max_body_size: u32,
}

impl PacketDecoder {
    /// Create a decoder with the default maximum body size (64 MiB).
    pub fn new() -> Self {
        Self::with_max_body(DEFAULT_MAX_BODY_SIZE)
    }

    /// Create a decoder with a custom maximum body size.
    pub fn with_max_body(max_body_size: u32) -> Self {
        Self {
            buffer: SegmentedBuffer::new(),
            state: State::AwaitingHeader,
            max_body_size,
        }
    }

    /// Push data into the decoder and extract all complete packets.
    ///
    /// Partial data stays buffered for the next push.
    ///
    /// # Errors
    ///
    /// Returns a framing error for an unknown tag or an oversized body and a
    /// decode error for a malformed body. Both leave the decoder unusable.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Packet>> {
        self.append(data);

        let mut packets = Vec::new();
        while let Some(packet) = self.next_packet()? {
            packets.push(packet);
        }
        Ok(packets)
    }

    /// Append data without extracting packets.
    pub fn append(&mut self, data: &[u8]) {
        self.buffer.append(data);
    }

    /// Try to extract a single packet.
    ///
    /// Returns:
    /// - `Ok(Some(packet))` if a complete packet was extracted
    /// - `Ok(None)` if more data is needed
    /// - `Err(...)` on a protocol violation
    pub fn next_packet(&mut self) -> Result<Option<Packet>> {
        loop {
            match self.state {
                State::AwaitingHeader => {
                    let mut raw = [0u8; HEADER_SIZE];
                    if !self.buffer.peek(&mut raw) {
                        return Ok(None);
                    }
                    let Some(header) = Header::decode(&raw)? else {
                        return Ok(None);
                    };
                    header.validate(self.max_body_size)?;
                    self.buffer.discard(HEADER_SIZE);

                    self.state = State::HaveHeader {
                        packet_type: header.packet_type,
                        length: header.body_length,
                    };
                }

                State::HaveHeader {
                    packet_type,
                    length,
                } => {
                    let length = length as usize;
                    if self.buffer.len() < length {
                        return Ok(None);
                    }

                    let before = self.buffer.len();
                    let packet = Packet::decode_body(packet_type, &mut self.buffer)?;
                    let consumed = before - self.buffer.len();
                    if consumed != length {
                        return Err(QueueWireError::Decode(format!(
                            "{:?} body declared {} bytes but used {}",
                            packet_type, length, consumed
                        )));
                    }

                    self.state = State::AwaitingHeader;
                    return Ok(Some(packet));
                }
            }
        }
    }

    /// Get the number of buffered bytes.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::AwaitingHeader;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::AwaitingHeader => "AwaitingHeader",
            State::HaveHeader { .. } => "HaveHeader",
        }
    }
}

impl Default for PacketDecoder {
    fn default() -> Self {
        Self::new()
    }
}
