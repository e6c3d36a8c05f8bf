//! Transport driver.
//!
//! Connects a [`ConnectionCore`] to a byte stream. The stream is split into
//! a read half and a write half, each owned by its own task.
//!
//! ## Task Layout
//!
//! ```text
//!   callers ──issue()──> [ ConnectionCore ] ──Outgoing──> writer task ──> transport
//!                             ^    (Mutex)
//!                             │
//!   transport ──> reader task ┘ receive(chunk)
//! ```
//!
//! Callers encode, enqueue and hand the frame to the writer channel while
//! holding the core lock, so frames reach the writer in enqueue order. The
//! writer batches whatever is queued and flushes once the channel is empty.
//!
//! ## Buffer Management
//!
//! The reader accumulates into a BytesMut buffer and hands each chunk to the
//! decoder, which keeps any partial value across reads.

use crate::connection::state::ConnectionCore;
use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

/// Initial read buffer capacity
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Core shared by the caller side and the reader task.
pub type SharedCore = Arc<Mutex<ConnectionCore>>;

/// Locks the core. A panic while holding the lock leaves the core in a
/// consistent state between calls, so poisoning is ignored.
pub fn lock_core(core: &Mutex<ConnectionCore>) -> MutexGuard<'_, ConnectionCore> {
    core.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Work for the writer task.
#[derive(Debug)]
pub enum Outgoing {
    /// An encoded command
    Frame(Bytes),
    /// Flush and shut the write half down
    Shutdown,
}

/// Transport counters for one connection.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Commands handed to the transport
    pub frames_written: AtomicU64,
    /// Total bytes read
    pub bytes_read: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frame_written(&self, len: usize) {
        self.frames_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// Handles to a running driver.
#[derive(Debug)]
pub struct Driver {
    pub writer: mpsc::UnboundedSender<Outgoing>,
    pub reader: AbortHandle,
}

/// Spawns the reader and writer tasks for `transport`.
///
/// Must be called from within a tokio runtime.
pub fn spawn<T>(transport: T, core: SharedCore, stats: Arc<ConnectionStats>, peer: String) -> Driver
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(transport);
    let (tx, rx) = mpsc::unbounded_channel();

    let reader = tokio::spawn(read_loop(
        read_half,
        Arc::clone(&core),
        Arc::clone(&stats),
        tx.clone(),
        peer.clone(),
    ));
    tokio::spawn(write_loop(write_half, rx, core, stats, peer));

    Driver {
        writer: tx,
        reader: reader.abort_handle(),
    }
}

/// Reads until EOF, an I/O error, or a protocol failure, then asks the
/// writer to shut the write half down.
async fn read_loop<R>(
    reader: R,
    core: SharedCore,
    stats: Arc<ConnectionStats>,
    writer: mpsc::UnboundedSender<Outgoing>,
    peer: String,
) where
    R: AsyncRead + Unpin,
{
    read_until_terminal(reader, &core, &stats, &peer).await;
    if writer.send(Outgoing::Shutdown).is_err() {
        trace!(peer = %peer, "Writer already stopped");
    }
}

async fn read_until_terminal<R>(
    mut reader: R,
    core: &SharedCore,
    stats: &ConnectionStats,
    peer: &str,
) where
    R: AsyncRead + Unpin,
{
    let mut buffer = BytesMut::with_capacity(INITIAL_BUFFER_SIZE);
    loop {
        buffer.clear();
        if buffer.capacity() < INITIAL_BUFFER_SIZE {
            buffer.reserve(INITIAL_BUFFER_SIZE);
        }

        let n = match reader.read_buf(&mut buffer).await {
            Ok(0) => {
                debug!(peer = %peer, "Server closed the connection");
                lock_core(core).fail("connection closed by server");
                return;
            }
            Ok(n) => n,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Read failed");
                lock_core(core).fail(format!("read error: {}", e));
                return;
            }
        };

        stats.bytes_read(n);
        trace!(peer = %peer, bytes = n, "Read data");

        let mut guard = lock_core(core);
        if let Err(e) = guard.receive(&buffer[..n]) {
            warn!(peer = %peer, error = %e, "Protocol error, dropping connection");
            return;
        }
        if guard.state().is_terminal() {
            debug!(peer = %peer, state = %guard.state(), "Connection ended");
            return;
        }
    }
}

/// Writes frames in channel order, flushing whenever the channel runs dry.
async fn write_loop<W>(
    writer: W,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
    core: SharedCore,
    stats: Arc<ConnectionStats>,
    peer: String,
) where
    W: AsyncWrite + Unpin,
{
    let mut writer = BufWriter::new(writer);

    while let Some(first) = rx.recv().await {
        let mut next = Some(first);
        let mut shutdown = false;

        while let Some(outgoing) = next.take() {
            match outgoing {
                Outgoing::Frame(frame) => {
                    if let Err(e) = writer.write_all(&frame).await {
                        warn!(peer = %peer, error = %e, "Write failed");
                        lock_core(&core).fail(format!("write error: {}", e));
                        return;
                    }
                    stats.frame_written(frame.len());
                }
                Outgoing::Shutdown => {
                    shutdown = true;
                    break;
                }
            }
            next = rx.try_recv().ok();
        }

        if let Err(e) = writer.flush().await {
            warn!(peer = %peer, error = %e, "Flush failed");
            lock_core(&core).fail(format!("write error: {}", e));
            return;
        }
        trace!(peer = %peer, "Flushed");

        if shutdown {
            break;
        }
    }

    if let Err(e) = writer.shutdown().await {
        debug!(peer = %peer, error = %e, "Transport shutdown failed");
    }
    debug!(peer = %peer, "Writer stopped");
}
