//! MessagePack codec for typed queue payloads, using `rmp-serde`.
//!
//! Structs are written with `to_vec_named` (struct-as-map), so a consumer
//! can decode a payload even if the producer's struct gained or reordered
//! fields.
//!
//! # Example
//!
//! ```
//! use queuewire::codec::MsgPackCodec;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Job {
//!     id: u32,
//!     url: String,
//! }
//!
//! let job = Job { id: 7, url: "https://example.com".into() };
//! let payload = MsgPackCodec::encode(&job).unwrap();
//! let decoded: Job = MsgPackCodec::decode(&payload).unwrap();
//! assert_eq!(decoded, job);
//! ```

use bytes::Bytes;

use crate::error::Result;

/// MessagePack codec for queue payloads.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value into a payload.
    #[inline]
    pub fn encode<T: serde::Serialize + ?Sized>(value: &T) -> Result<Bytes> {
        Ok(Bytes::from(rmp_serde::to_vec_named(value)?))
    }

    /// Decode a payload into a value.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(payload: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(payload)?)
    }
}
