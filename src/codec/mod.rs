//! Codec module - serialization of typed payloads.
//!
//! Queue payloads are opaque bytes. [`MsgPackCodec`] turns serde values into
//! payloads and back for the typed helpers of
//! [`AsyncClient`](crate::client::AsyncClient).
//!
//! Codecs are marker structs with static methods, so the codec is chosen at
//! compile time.

mod msgpack;

pub use msgpack::MsgPackCodec;
