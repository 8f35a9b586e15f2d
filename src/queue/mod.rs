//! Queue module - per-queue matching engine and the registry of named queues.

mod capacity;
mod engine;
mod registry;

pub use capacity::{ByteCapacity, DEFAULT_MAX_QUEUE_BYTES};
pub use engine::{ClientId, PopCompletion, PushCompletion, QueueEngine, QueueStats};
pub use registry::QueueRegistry;
