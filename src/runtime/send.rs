//! Outbound queue and the send thread's flush.
//!
//! Business threads push encoded frames; the send thread writes them
//! without blocking. A frame that does not fit in the socket buffer is
//! parked on its connection as `pending_write` and finished by the reactor
//! once the socket turns writable. While a connection has such a throttled
//! write, its other queued frames stay in the queue, preserving order.

use crate::runtime::connection::{ConnRef, Connection, ConnIo, InterestMode};
use crate::runtime::sync::Semaphore;
use bytes::{Buf, Bytes};
use mio::{Interest, Registry};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of handing a frame to the outbound path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    Queued,
    /// The whole queue is at capacity; the frame was dropped.
    QueueFull,
    /// The connection had too many frames queued; dropped and the connection closed.
    Backlog,
    /// The connection no longer exists.
    Stale,
}

pub struct Outgoing {
    pub target: ConnRef,
    pub conn: Arc<Connection>,
    pub frame: Bytes,
}

/// Outcome of one non-blocking write attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum WriteStatus {
    Complete,
    /// Peer accepted nothing; the frame is dropped.
    Zero,
    /// The remainder must wait for write readiness.
    Blocked(Bytes),
}

pub struct SendQueue {
    queue: Mutex<VecDeque<Outgoing>>,
    max_len: usize,
    discarded: AtomicU64,
    ready: Semaphore,
}

impl SendQueue {
    pub fn new(max_len: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            max_len,
            discarded: AtomicU64::new(0),
            ready: Semaphore::new(0),
        }
    }

    /// Queue a frame and wake the send thread.
    pub fn push(&self, item: Outgoing) -> Enqueue {
        let mut queue = self.queue.lock();
        if queue.len() >= self.max_len {
            drop(queue);
            let discarded = self.discard();
            warn!(
                conn_id = item.target.index,
                discarded, "Send queue full, dropping frame"
            );
            return Enqueue::QueueFull;
        }
        item.conn.inc_queued_sends();
        queue.push_back(item);
        drop(queue);

        self.ready.post();
        Enqueue::Queued
    }

    /// Count a frame dropped before it reached the queue.
    pub fn discard(&self) -> u64 {
        self.discarded.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Wake the send thread without queuing anything.
    pub fn notify(&self) {
        self.ready.post();
    }

    pub fn wait(&self) {
        self.ready.wait();
    }

    pub fn clear(&self) -> usize {
        let mut queue = self.queue.lock();
        let dropped = queue.len();
        queue.clear();
        dropped
    }

    /// Write every queued frame whose connection is not throttled.
    pub fn flush(&self, registry: &Registry) {
        let mut queue = self.queue.lock();
        queue.retain(|item| {
            if item.conn.generation() != item.target.generation {
                debug!(conn_id = item.target.index, "Dropping frame for stale connection");
                return false;
            }
            if item.conn.throttled_writes() > 0 {
                return true;
            }

            let mut io = match item.conn.lock_current(item.target.generation) {
                Some(io) => io,
                None => return false,
            };
            item.conn.dec_queued_sends();

            match write_frame(&mut io, item.frame.clone()) {
                Ok(WriteStatus::Complete) => {}
                Ok(WriteStatus::Zero) => {
                    debug!(conn_id = item.target.index, "Peer accepted no bytes, frame dropped");
                }
                Ok(WriteStatus::Blocked(rest)) => {
                    io.pending_write = Some(rest);
                    item.conn.inc_throttled();
                    if let Err(e) =
                        io.modify_interest(registry, item.target.index, Interest::WRITABLE, InterestMode::Add)
                    {
                        warn!(conn_id = item.target.index, error = %e, "Failed to add write interest");
                    }
                }
                Err(e) => {
                    debug!(conn_id = item.target.index, error = %e, "Send failed");
                }
            }
            false
        });
    }
}

/// Try to write `frame` in one go.
pub(crate) fn write_frame(io: &mut ConnIo, mut frame: Bytes) -> io::Result<WriteStatus> {
    let stream = match io.stream.as_mut() {
        Some(stream) => stream,
        None => return Err(io::Error::new(io::ErrorKind::NotConnected, "socket closed")),
    };

    loop {
        match stream.write(&frame) {
            Ok(0) => return Ok(WriteStatus::Zero),
            Ok(n) if n == frame.len() => return Ok(WriteStatus::Complete),
            Ok(n) => {
                frame.advance(n);
                return Ok(WriteStatus::Blocked(frame));
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Ok(WriteStatus::Blocked(frame));
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}
