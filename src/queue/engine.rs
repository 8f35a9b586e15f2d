//! Per-queue matching engine.
//!
//! A queue holds two FIFOs:
//! - buffered entries: a payload plus, for blocking pushes, the pusher
//!   waiting to hear that its payload was consumed
//! - pending poppers waiting for a payload
//!
//! At most one of them is non-empty at any time: a push meets the oldest
//! waiting popper before it is buffered, and a pop drains the oldest entry
//! before it waits. Completions are invoked exactly once, either inside the
//! call that matched them, on timeout, or when their connection goes away.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;

use super::capacity::ByteCapacity;
use crate::protocol::{PopError, PushError};

/// Identifies the connection that issued a request.
pub type ClientId = u64;

/// Receives the outcome of a blocking push.
pub type PushCompletion = Box<dyn FnOnce(Result<(), PushError>) + Send>;

/// Receives the outcome of a blocking pop.
pub type PopCompletion = Box<dyn FnOnce(Result<Bytes, PopError>) + Send>;

struct PendingPusher {
    requester: ClientId,
    deadline: Option<Instant>,
    completion: PushCompletion,
}

struct Entry {
    pusher: Option<PendingPusher>,
    payload: Bytes,
}

struct PendingPopper {
    requester: ClientId,
    deadline: Option<Instant>,
    completion: PopCompletion,
}

fn deadline(now: Instant, timeout: Option<Duration>) -> Option<Instant> {
    timeout.and_then(|timeout| now.checked_add(timeout))
}

fn expired(deadline: Option<Instant>, now: Instant) -> bool {
    deadline.map_or(false, |deadline| deadline <= now)
}

/// Snapshot of a queue's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub name: String,
    pub current_bytes: usize,
    pub max_bytes: usize,
    /// Buffered payloads, with or without a waiting pusher.
    pub buffered: usize,
    /// Buffered payloads whose pusher is still waiting.
    pub pending_pushers: usize,
    pub waiting_poppers: usize,
}

/// A single named FIFO queue with backpressure and timeouts.
pub struct QueueEngine {
    name: String,
    capacity: ByteCapacity,
    entries: VecDeque<Entry>,
    poppers: VecDeque<PendingPopper>,
}

impl QueueEngine {
    /// Create an empty queue holding at most `max_bytes` buffered bytes.
    pub fn new(name: impl Into<String>, max_bytes: usize) -> Self {
        Self {
            name: name.into(),
            capacity: ByteCapacity::new(max_bytes),
            entries: VecDeque::new(),
            poppers: VecDeque::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bytes currently buffered.
    pub fn current_bytes(&self) -> usize {
        self.capacity.current()
    }

    pub fn max_bytes(&self) -> usize {
        self.capacity.max()
    }

    /// Number of buffered payloads.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of poppers waiting for a payload.
    pub fn waiting_poppers(&self) -> usize {
        self.poppers.len()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            name: self.name.clone(),
            current_bytes: self.capacity.current(),
            max_bytes: self.capacity.max(),
            buffered: self.entries.len(),
            pending_pushers: self.entries.iter().filter(|e| e.pusher.is_some()).count(),
            waiting_poppers: self.poppers.len(),
        }
    }

    /// Blocking push.
    ///
    /// `completion` receives `QueueFull` immediately if the payload does not
    /// fit, success immediately if a popper was waiting, and otherwise
    /// success once the payload is popped or `Timeout` once `timeout` elapses.
    pub fn push(
        &mut self,
        payload: Bytes,
        timeout: Option<Duration>,
        requester: ClientId,
        completion: PushCompletion,
    ) {
        self.push_at(payload, timeout, requester, completion, Instant::now());
    }

    /// [`push`](Self::push) with an explicit current time.
    pub fn push_at(
        &mut self,
        payload: Bytes,
        timeout: Option<Duration>,
        requester: ClientId,
        completion: PushCompletion,
        now: Instant,
    ) {
        let payload = match self.hand_off(payload) {
            Ok(()) => {
                completion(Ok(()));
                return;
            }
            Err(Some(payload)) => payload,
            Err(None) => {
                completion(Err(PushError::QueueFull));
                return;
            }
        };

        self.capacity.reserve(payload.len());
        self.entries.push_back(Entry {
            pusher: Some(PendingPusher {
                requester,
                deadline: deadline(now, timeout),
                completion,
            }),
            payload,
        });
    }

    /// Non-blocking push.
    ///
    /// Returns `false` if the payload does not fit. An accepted payload is
    /// either handed to a waiting popper or buffered without a pusher.
    pub fn try_push(&mut self, payload: Bytes) -> bool {
        match self.hand_off(payload) {
            Ok(()) => true,
            Err(Some(payload)) => {
                self.capacity.reserve(payload.len());
                self.entries.push_back(Entry {
                    pusher: None,
                    payload,
                });
                true
            }
            Err(None) => false,
        }
    }

    /// Capacity check, then delivery to the oldest waiting popper.
    ///
    /// `Err(None)` means the payload does not fit, `Err(Some(payload))` that
    /// it fits but nobody is waiting.
    fn hand_off(&mut self, payload: Bytes) -> Result<(), Option<Bytes>> {
        if !self.capacity.can_fit(payload.len()) {
            return Err(None);
        }
        match self.poppers.pop_front() {
            Some(popper) => {
                (popper.completion)(Ok(payload));
                Ok(())
            }
            None => Err(Some(payload)),
        }
    }

    /// Blocking pop.
    ///
    /// `completion` receives the oldest buffered payload immediately if there
    /// is one, otherwise the next pushed payload or `Timeout` once `timeout`
    /// elapses.
    pub fn pop(
        &mut self,
        timeout: Option<Duration>,
        requester: ClientId,
        completion: PopCompletion,
    ) {
        self.pop_at(timeout, requester, completion, Instant::now());
    }

    /// [`pop`](Self::pop) with an explicit current time.
    pub fn pop_at(
        &mut self,
        timeout: Option<Duration>,
        requester: ClientId,
        completion: PopCompletion,
        now: Instant,
    ) {
        match self.try_pop() {
            Some(payload) => completion(Ok(payload)),
            None => self.poppers.push_back(PendingPopper {
                requester,
                deadline: deadline(now, timeout),
                completion,
            }),
        }
    }

    /// Non-blocking pop of the oldest buffered payload.
    ///
    /// A pusher waiting on that payload is completed with success.
    pub fn try_pop(&mut self) -> Option<Bytes> {
        let entry = self.entries.pop_front()?;
        self.capacity.release(entry.payload.len());
        if let Some(pusher) = entry.pusher {
            (pusher.completion)(Ok(()));
        }
        Some(entry.payload)
    }

    /// Expire waiters whose deadline has passed.
    pub fn prune_timed_out(&mut self) -> usize {
        self.prune_timed_out_at(Instant::now())
    }

    /// [`prune_timed_out`](Self::prune_timed_out) with an explicit current time.
    ///
    /// Expired poppers receive `Timeout`. Expired blocking pushes receive
    /// `Timeout` and their payload leaves the buffer. Returns the number of
    /// waiters expired.
    pub fn prune_timed_out_at(&mut self, now: Instant) -> usize {
        let mut count = 0;

        let poppers = std::mem::take(&mut self.poppers);
        for popper in poppers {
            if expired(popper.deadline, now) {
                (popper.completion)(Err(PopError::Timeout));
                count += 1;
            } else {
                self.poppers.push_back(popper);
            }
        }

        let entries = std::mem::take(&mut self.entries);
        for entry in entries {
            match entry.pusher {
                Some(pusher) if expired(pusher.deadline, now) => {
                    self.capacity.release(entry.payload.len());
                    (pusher.completion)(Err(PushError::Timeout));
                    count += 1;
                }
                pusher => self.entries.push_back(Entry {
                    pusher,
                    payload: entry.payload,
                }),
            }
        }

        count
    }

    /// Cancel every waiter owned by `requester`.
    ///
    /// Its poppers are removed and its pushers detached from their entries,
    /// each receiving `ConnectionClosed`. Detached payloads stay buffered.
    pub fn cancel_requester(&mut self, requester: ClientId) -> usize {
        let mut count = 0;

        let poppers = std::mem::take(&mut self.poppers);
        for popper in poppers {
            if popper.requester == requester {
                (popper.completion)(Err(PopError::ConnectionClosed));
                count += 1;
            } else {
                self.poppers.push_back(popper);
            }
        }

        for entry in self.entries.iter_mut() {
            if entry.pusher.as_ref().map_or(false, |p| p.requester == requester) {
                if let Some(pusher) = entry.pusher.take() {
                    (pusher.completion)(Err(PushError::ConnectionClosed));
                    count += 1;
                }
            }
        }

        count
    }
}

impl std::fmt::Debug for QueueEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueEngine")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("buffered", &self.entries.len())
            .field("waiting_poppers", &self.poppers.len())
            .finish()
    }
}
