//! Named queues, created on first reference.

use std::collections::HashMap;
use std::time::Instant;

use super::capacity::DEFAULT_MAX_QUEUE_BYTES;
use super::engine::{ClientId, QueueEngine, QueueStats};

/// All queues of a broker, keyed by name.
#[derive(Debug)]
pub struct QueueRegistry {
    queues: HashMap<String, QueueEngine>,
    max_queue_bytes: usize,
}

impl QueueRegistry {
    /// Create a registry whose queues hold at most `max_queue_bytes` each.
    pub fn new(max_queue_bytes: usize) -> Self {
        Self {
            queues: HashMap::new(),
            max_queue_bytes,
        }
    }

    /// Get the queue called `name`, creating it if needed.
    pub fn queue(&mut self, name: String) -> &mut QueueEngine {
        let max_bytes = self.max_queue_bytes;
        self.queues.entry(name).or_insert_with_key(|name| {
            tracing::debug!("Creating queue {:?} ({} bytes)", name, max_bytes);
            QueueEngine::new(name.clone(), max_bytes)
        })
    }

    /// Get an existing queue.
    pub fn get(&self, name: &str) -> Option<&QueueEngine> {
        self.queues.get(name)
    }

    /// Number of queues created so far.
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Expire timed-out waiters in every queue.
    pub fn prune_all(&mut self) -> usize {
        self.prune_all_at(Instant::now())
    }

    /// [`prune_all`](Self::prune_all) with an explicit current time.
    pub fn prune_all_at(&mut self, now: Instant) -> usize {
        self.queues
            .values_mut()
            .map(|queue| queue.prune_timed_out_at(now))
            .sum()
    }

    /// Cancel every waiter of `requester` in every queue.
    pub fn cancel_requester(&mut self, requester: ClientId) -> usize {
        self.queues
            .values_mut()
            .map(|queue| queue.cancel_requester(requester))
            .sum()
    }

    /// Stats of every queue, sorted by name.
    pub fn stats(&self) -> Vec<QueueStats> {
        let mut stats: Vec<_> = self.queues.values().map(QueueEngine::stats).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }
}

impl Default for QueueRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_QUEUE_BYTES)
    }
}
