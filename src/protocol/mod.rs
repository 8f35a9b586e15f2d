//! Protocol module - wire format, packets, and incremental decoding.
//!
//! This module implements the binary broker protocol:
//! - 5-byte header encoding/decoding
//! - Packet variants with their body layout
//! - Packet decoder for accumulating partial reads

mod decoder;
mod packet;
mod wire_format;

pub use decoder::PacketDecoder;
pub use packet::{
    timeout_to_millis, ConnectionError, ConnectionRequest, ConnectionResponse, Packet, PopError,
    PopRequest, PopResponse, PushError, PushRequest, PushResponse, TryPopRequest, TryPushRequest,
};
pub use wire_format::{Header, PacketType, DEFAULT_MAX_BODY_SIZE, HEADER_SIZE};
