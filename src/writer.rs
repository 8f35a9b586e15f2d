//! Dedicated writer task for sending encoded packets.
//!
//! Each connection owns one writer task that receives packets over an mpsc
//! channel and writes them with scatter/gather I/O. Producers never touch the
//! socket, so the broker loop and completions only need a cloneable handle.
//!
//! # Architecture
//!
//! ```text
//! Broker loop ──┐
//! Completion  ──┼─► mpsc::Sender<OutboundPacket> ─► Writer Task ─► Socket
//! Completion  ──┘
//! ```
//!
//! A write error marks the handle as failed so the owner can drop the
//! connection after the current tick.

use std::io::IoSlice;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{QueueWireError, Result};
use crate::protocol::{Header, HEADER_SIZE};

/// Default maximum pending packets before sends are rejected.
pub const DEFAULT_MAX_PENDING_PACKETS: usize = 4096;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 4096;

/// Maximum packets to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// A packet ready to be written to the socket.
#[derive(Debug, Clone)]
pub struct OutboundPacket {
    /// Pre-encoded header (5 bytes).
    pub header: [u8; HEADER_SIZE],
    /// Body chunks in order (empty for Disconnect).
    pub body: Vec<Bytes>,
}

impl OutboundPacket {
    /// Create a new outbound packet.
    #[inline]
    pub fn new(header: &Header, body: Vec<Bytes>) -> Self {
        Self {
            header: header.encode(),
            body,
        }
    }

    /// Total size of this packet (header + body).
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.body.iter().map(Bytes::len).sum::<usize>()
    }

    /// Flatten header and body into one byte vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size());
        out.extend_from_slice(&self.header);
        for chunk in &self.body {
            out.extend_from_slice(chunk);
        }
        out
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Maximum packets queued but not yet written.
    pub max_pending_packets: usize,
    /// Channel capacity for the packet queue.
    pub channel_capacity: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_packets: DEFAULT_MAX_PENDING_PACKETS,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Handle for sending packets to the writer task.
///
/// Cheaply cloneable; completions stored in queues each hold one.
#[derive(Debug, Clone)]
pub struct WriterHandle {
    /// Channel sender for packets.
    tx: mpsc::Sender<OutboundPacket>,
    /// Pending packet count.
    pending: Arc<AtomicUsize>,
    /// Set once a send or write failed.
    failed: Arc<AtomicBool>,
    /// Maximum pending packets.
    max_pending: usize,
}

impl WriterHandle {
    fn new(
        tx: mpsc::Sender<OutboundPacket>,
        pending: Arc<AtomicUsize>,
        failed: Arc<AtomicBool>,
        max_pending: usize,
    ) -> Self {
        Self {
            tx,
            pending,
            failed,
            max_pending,
        }
    }

    /// Queue a packet without waiting.
    ///
    /// Returns `Err(Backpressure)` if the pending limit is reached and
    /// `Err(ConnectionClosed)` if the writer task is gone.
    pub fn try_send(&self, packet: OutboundPacket) -> Result<()> {
        if self.is_failed() {
            return Err(QueueWireError::ConnectionClosed);
        }
        let current = self.pending.load(Ordering::Acquire);
        if current >= self.max_pending {
            return Err(QueueWireError::Backpressure);
        }

        self.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.try_send(packet).map_err(|e| {
            self.pending.fetch_sub(1, Ordering::Release);
            match e {
                mpsc::error::TrySendError::Full(_) => QueueWireError::Backpressure,
                mpsc::error::TrySendError::Closed(_) => QueueWireError::ConnectionClosed,
            }
        })
    }

    /// Mark the connection behind this handle as failed.
    #[inline]
    pub fn mark_failed(&self) {
        self.failed.store(true, Ordering::Release);
    }

    /// Check if a send or write failed on this connection.
    #[inline]
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Get current pending packet count.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

/// Spawn the writer task and return a handle for sending packets.
///
/// The task ends cleanly once every handle is dropped, or with an error when
/// a write fails.
pub fn spawn_writer_task<W>(
    writer: W,
    config: &WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let pending = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicBool::new(false));

    let handle = WriterHandle::new(
        tx,
        pending.clone(),
        failed.clone(),
        config.max_pending_packets,
    );

    let task = tokio::spawn(async move {
        let result = writer_loop(rx, writer, pending).await;
        if let Err(e) = &result {
            failed.store(true, Ordering::Release);
            tracing::debug!("Writer task stopped: {}", e);
        }
        result
    });

    (handle, task)
}

/// Receive packets and write them in batches.
async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundPacket>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let Some(first) = rx.recv().await else {
            let _ = writer.shutdown().await;
            return Ok(());
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);

        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(packet) => batch.push(packet),
                Err(_) => break,
            }
        }

        let batch_size = batch.len();
        write_batch(&mut writer, &batch).await?;

        pending.fetch_sub(batch_size, Ordering::Release);
    }
}

/// Write a batch of packets using scatter/gather I/O (write_vectored).
async fn write_batch<W>(writer: &mut W, batch: &[OutboundPacket]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let total_size: usize = batch.iter().map(OutboundPacket::size).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        if slices.is_empty() {
            break;
        }

        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(QueueWireError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for the data left after `skip_bytes` were written.
fn build_remaining_slices(batch: &[OutboundPacket], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut offset = 0;

    let parts = batch.iter().flat_map(|packet| {
        std::iter::once(&packet.header[..]).chain(packet.body.iter().map(|chunk| &chunk[..]))
    });

    for part in parts {
        if part.is_empty() {
            continue;
        }
        let end = offset + part.len();
        if skip_bytes < end {
            let start = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&part[start..]));
        }
        offset = end;
    }

    slices
}
