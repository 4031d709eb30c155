//! Connection slots.
//!
//! A [`Connection`] is a reusable pool slot. Its identity is the slot index
//! plus a generation that changes every time the slot is handed out or
//! scheduled for recycling, so anything holding a [`ConnRef`] can detect
//! that the socket it was talking to is gone.
//!
//! Locking: the pool lock may be held while taking `io`, never the reverse.

use crate::runtime::recv::{FloodGuard, PacketAssembler};
use bytes::Bytes;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use parking_lot::{Mutex, MutexGuard};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;
use tracing::warn;

/// Reference to one incarnation of a connection slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnRef {
    pub index: usize,
    pub generation: u64,
}

/// How [`ConnIo::modify_interest`] combines the given interest with the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterestMode {
    Add,
    Clear,
    Replace,
}

/// Socket-side state, touched by the reactor and the send thread.
pub struct ConnIo {
    pub stream: Option<TcpStream>,
    pub peer: Option<SocketAddr>,
    /// Port of the listener that accepted the socket.
    pub listener_port: u16,
    pub interest: Option<Interest>,
    pub recv: PacketAssembler,
    /// Unsent remainder of a frame waiting for write readiness.
    pub pending_write: Option<Bytes>,
    pub flood: FloodGuard,
}

impl ConnIo {
    fn new(max_packet_len: u16) -> Self {
        Self {
            stream: None,
            peer: None,
            listener_port: 0,
            interest: None,
            recv: PacketAssembler::new(max_packet_len),
            pending_write: None,
            flood: FloodGuard::new(Instant::now()),
        }
    }

    /// Change the registered interest set and re-associate the token with `index`.
    ///
    /// Clearing the last interest leaves the registration in place with read
    /// interest, mio cannot register an empty set.
    pub fn modify_interest(
        &mut self,
        registry: &Registry,
        index: usize,
        interest: Interest,
        mode: InterestMode,
    ) -> io::Result<()> {
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return Ok(()),
        };

        let next = match (mode, self.interest) {
            (InterestMode::Replace, _) | (InterestMode::Add, None) => Some(interest),
            (InterestMode::Add, Some(current)) => Some(current | interest),
            (InterestMode::Clear, Some(current)) => current.remove(interest),
            (InterestMode::Clear, None) => None,
        };
        let next = next.unwrap_or(Interest::READABLE);

        registry.reregister(stream, Token(index), next)?;
        self.interest = Some(next);
        Ok(())
    }
}

/// Per-connection state owned by business handlers.
#[derive(Debug)]
pub struct Session {
    /// Last heartbeat seen from the client.
    pub last_ping: Instant,
}

/// One pool slot.
pub struct Connection {
    index: usize,
    generation: AtomicU64,
    pub(crate) io: Mutex<ConnIo>,
    /// Business mutex; handlers serialize on it.
    pub session: Mutex<Session>,
    queued_sends: AtomicUsize,
    throttled_writes: AtomicUsize,
}

impl Connection {
    pub(crate) fn new(index: usize, max_packet_len: u16) -> Self {
        Self {
            index,
            generation: AtomicU64::new(0),
            io: Mutex::new(ConnIo::new(max_packet_len)),
            session: Mutex::new(Session {
                last_ping: Instant::now(),
            }),
            queued_sends: AtomicUsize::new(0),
            throttled_writes: AtomicUsize::new(0),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn conn_ref(&self) -> ConnRef {
        ConnRef {
            index: self.index,
            generation: self.generation(),
        }
    }

    /// Advance the generation. Only the pool calls this, under its lock.
    pub(crate) fn bump_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Lock the socket state if the slot still belongs to `generation` and is open.
    pub(crate) fn lock_current(&self, generation: u64) -> Option<MutexGuard<'_, ConnIo>> {
        let io = self.io.lock();
        if self.generation() != generation || io.stream.is_none() {
            return None;
        }
        Some(io)
    }

    /// Reinitialize transient state before the slot is handed out again.
    ///
    /// Runs under the pool lock, so the business mutex is left alone.
    pub(crate) fn reset(&self, now: Instant) {
        let mut io = self.io.lock();
        if io.pending_write.is_some() {
            warn!(
                conn_id = self.index,
                throttled = self.throttled_writes(),
                "Recycling connection with an unfinished write"
            );
        }
        io.stream = None;
        io.peer = None;
        io.listener_port = 0;
        io.interest = None;
        io.recv.reset();
        io.pending_write = None;
        io.flood = FloodGuard::new(now);
        drop(io);

        self.queued_sends.store(0, Ordering::Release);
        self.throttled_writes.store(0, Ordering::Release);
    }

    pub fn queued_sends(&self) -> usize {
        self.queued_sends.load(Ordering::Acquire)
    }

    pub(crate) fn inc_queued_sends(&self) {
        self.queued_sends.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn dec_queued_sends(&self) {
        saturating_dec(&self.queued_sends);
    }

    pub fn throttled_writes(&self) -> usize {
        self.throttled_writes.load(Ordering::Acquire)
    }

    pub(crate) fn inc_throttled(&self) {
        self.throttled_writes.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn dec_throttled(&self) {
        saturating_dec(&self.throttled_writes);
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.io.lock().peer
    }
}

fn saturating_dec(counter: &AtomicUsize) {
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_bumps() {
        let conn = Connection::new(3, 100);
        assert_eq!(conn.generation(), 0);
        assert_eq!(conn.bump_generation(), 1);
        assert_eq!(
            conn.conn_ref(),
            ConnRef {
                index: 3,
                generation: 1
            }
        );
    }

    #[test]
    fn test_lock_current_requires_open_socket() {
        let conn = Connection::new(0, 100);
        assert!(conn.lock_current(0).is_none());
    }

    #[test]
    fn test_counters_saturate_at_zero() {
        let conn = Connection::new(0, 100);
        conn.dec_throttled();
        conn.dec_queued_sends();
        assert_eq!(conn.throttled_writes(), 0);
        assert_eq!(conn.queued_sends(), 0);

        conn.inc_throttled();
        conn.inc_queued_sends();
        conn.inc_queued_sends();
        conn.dec_queued_sends();
        assert_eq!(conn.throttled_writes(), 1);
        assert_eq!(conn.queued_sends(), 1);
    }

    #[test]
    fn test_modify_interest_modes() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let _client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();

        let mut poll = mio::Poll::new().unwrap();
        let mut events = mio::Events::with_capacity(8);
        let registry = poll.registry().try_clone().unwrap();
        let mut stream = TcpStream::from_std(server);
        registry
            .register(&mut stream, Token(7), Interest::READABLE)
            .unwrap();

        let conn = Connection::new(7, 100);
        let mut io = conn.io.lock();
        io.stream = Some(stream);
        io.interest = Some(Interest::READABLE);

        io.modify_interest(&registry, 7, Interest::WRITABLE, InterestMode::Add)
            .unwrap();
        assert_eq!(io.interest, Some(Interest::READABLE | Interest::WRITABLE));
        poll.poll(&mut events, Some(std::time::Duration::from_secs(1)))
            .unwrap();
        assert!(events
            .iter()
            .any(|event| event.token() == Token(7) && event.is_writable()));

        io.modify_interest(&registry, 7, Interest::WRITABLE, InterestMode::Clear)
            .unwrap();
        assert_eq!(io.interest, Some(Interest::READABLE));

        io.modify_interest(&registry, 7, Interest::WRITABLE, InterestMode::Replace)
            .unwrap();
        assert_eq!(io.interest, Some(Interest::WRITABLE));

        // Clearing the only bit falls back to read interest.
        io.modify_interest(&registry, 7, Interest::WRITABLE, InterestMode::Clear)
            .unwrap();
        assert_eq!(io.interest, Some(Interest::READABLE));
    }

    #[test]
    fn test_modify_interest_without_socket_is_noop() {
        let poll = mio::Poll::new().unwrap();
        let conn = Connection::new(0, 100);
        let mut io = conn.io.lock();
        io.modify_interest(poll.registry(), 0, Interest::WRITABLE, InterestMode::Add)
            .unwrap();
        assert!(io.interest.is_none());
    }

    #[test]
    fn test_reset_clears_transient_state() {
        let conn = Connection::new(0, 100);
        conn.inc_throttled();
        conn.inc_queued_sends();
        conn.io.lock().pending_write = Some(Bytes::from_static(b"tail"));

        conn.reset(Instant::now());
        assert_eq!(conn.throttled_writes(), 0);
        assert_eq!(conn.queued_sends(), 0);
        assert!(conn.io.lock().pending_write.is_none());
    }
}
