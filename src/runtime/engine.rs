//! Shared state of one worker process.
//!
//! The [`Engine`] owns the connection pool and the queues between the
//! reactor, the business threads and the send/recycle/timer threads. The
//! reactor thread drives it through `admit`, `handle_readable` and
//! `handle_writable`; everything else runs on the background threads.
//!
//! Lock order: pool -> conn io, send queue -> conn io. The timer lock and the
//! inbound queue lock are never held while taking another lock.

use crate::config::Config;
use crate::protocol::Packet;
use crate::runtime::connection::{ConnRef, Connection, InterestMode};
use crate::runtime::dispatch::{Dispatcher, Message, Request};
use crate::runtime::pool::ConnectionPool;
use crate::runtime::recv::Step;
use crate::runtime::send::{write_frame, Enqueue, Outgoing, SendQueue, WriteStatus};
use crate::runtime::sync::Shutdown;
use crate::runtime::threadpool::ThreadPool;
use crate::runtime::timer::{TimeoutAction, TimeoutPolicy, TimerQueue};
use mio::net::TcpStream;
use mio::{Interest, Registry, Token, Waker};
use parking_lot::Mutex;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

const RECYCLE_INTERVAL: Duration = Duration::from_millis(200);
const TIMER_INTERVAL: Duration = Duration::from_millis(500);

/// Inbound backlog above this is reported with the statistics.
const INBOUND_BACKLOG_WARN: usize = 100_000;

/// Reject accepts once the pool is this many times `worker_connections`
/// and the free list has run low.
const POOL_GROWTH_FACTOR: usize = 5;

#[derive(Debug, Clone, Copy)]
struct FloodLimits {
    interval: Duration,
    kick_count: u32,
}

pub struct Engine {
    worker_connections: usize,
    heartbeat_wait: Option<Duration>,
    flood: Option<FloodLimits>,
    recycle_wait: Duration,
    max_conn_backlog: usize,
    pool: ConnectionPool,
    outbound: SendQueue,
    timers: Mutex<TimerQueue>,
    inbound: ThreadPool,
    dispatcher: Dispatcher,
    policy: Box<dyn TimeoutPolicy>,
    registry: Registry,
    waker: Waker,
    shutdown: Shutdown,
}

impl Engine {
    pub fn new(
        config: &Config,
        dispatcher: Dispatcher,
        policy: Box<dyn TimeoutPolicy>,
        registry: Registry,
        waker: Waker,
    ) -> Self {
        Self {
            worker_connections: config.worker_connections,
            heartbeat_wait: config.heartbeat.enabled.then(|| config.heartbeat_wait()),
            flood: config.flood.enabled.then(|| FloodLimits {
                interval: Duration::from_millis(config.flood.interval_ms),
                kick_count: config.flood.kick_count,
            }),
            recycle_wait: config.recycle_wait(),
            max_conn_backlog: config.send.max_conn_backlog,
            pool: ConnectionPool::with_capacity(config.worker_connections, config.max_packet_len),
            outbound: SendQueue::new(config.send.max_queue_len),
            timers: Mutex::new(TimerQueue::new()),
            inbound: ThreadPool::new(),
            dispatcher,
            policy,
            registry,
            waker,
            shutdown: Shutdown::new(),
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn outbound(&self) -> &SendQueue {
        &self.outbound
    }

    pub fn inbound(&self) -> &ThreadPool {
        &self.inbound
    }

    /// Entries waiting in the idle timer queue.
    pub fn timer_len(&self) -> usize {
        self.timers.lock().len()
    }

    pub fn heartbeat_enabled(&self) -> bool {
        self.heartbeat_wait.is_some()
    }

    pub fn is_stopping(&self) -> bool {
        self.shutdown.is_triggered()
    }

    /// Ask the reactor and the background threads to stop.
    pub fn request_stop(&self) {
        if self.shutdown.trigger() {
            info!("Worker stop requested");
        }
        self.outbound.notify();
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "Failed to wake reactor");
        }
    }

    /// Take ownership of a freshly accepted socket.
    ///
    /// Returns the new connection, or `None` if the socket was rejected and dropped.
    pub fn admit(&self, mut stream: TcpStream, peer: SocketAddr, listener_port: u16) -> Option<ConnRef> {
        let stats = self.pool.stats();
        if stats.online >= self.worker_connections {
            warn!(
                peer = %peer,
                online = stats.online,
                limit = self.worker_connections,
                "Connection limit reached, rejecting"
            );
            return None;
        }
        if stats.total > POOL_GROWTH_FACTOR * self.worker_connections
            && stats.free < self.worker_connections
        {
            warn!(
                peer = %peer,
                total = stats.total,
                free = stats.free,
                "Too many connections waiting for recycling, rejecting"
            );
            return None;
        }

        let conn = self.pool.acquire();
        let target = conn.conn_ref();
        {
            let mut io = conn.io.lock();
            if let Err(e) = self
                .registry
                .register(&mut stream, Token(target.index), Interest::READABLE)
            {
                drop(io);
                warn!(peer = %peer, error = %e, "Failed to register connection");
                self.pool.release(&conn);
                return None;
            }
            io.stream = Some(stream);
            io.peer = Some(peer);
            io.listener_port = listener_port;
            io.interest = Some(Interest::READABLE);
        }

        conn.session.lock().last_ping = Instant::now();
        let online = self.pool.mark_online();
        if let Some(wait) = self.heartbeat_wait {
            self.timers.lock().add(Instant::now() + wait, target);
        }

        debug!(conn_id = target.index, peer = %peer, port = listener_port, online, "Accepted connection");
        Some(target)
    }

    /// Read until the socket would block, feeding the receive state machine.
    pub fn handle_readable(&self, index: usize) {
        let conn = match self.pool.get(index) {
            Some(conn) => conn,
            None => return,
        };
        let generation = conn.generation();
        let mut io = match conn.lock_current(generation) {
            Some(io) => io,
            None => return,
        };
        let target = ConnRef { index, generation };
        let mut close = false;

        loop {
            let io = &mut *io;
            let stream = match io.stream.as_mut() {
                Some(stream) => stream,
                None => break,
            };

            let n = match stream.read(io.recv.buffer_mut()) {
                Ok(0) => {
                    debug!(conn_id = index, "Peer closed connection");
                    close = true;
                    break;
                }
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(conn_id = index, error = %e, "Read failed");
                    close = true;
                    break;
                }
            };

            match io.recv.advance(n) {
                Step::Pending => {}
                Step::Discarded(reason) => {
                    warn!(conn_id = index, reason = ?reason, "Discarding malformed packet");
                }
                Step::Complete(packet) => {
                    if let Some(limits) = self.flood {
                        if io
                            .flood
                            .record(Instant::now(), limits.interval, limits.kick_count)
                        {
                            warn!(conn_id = index, peer = ?io.peer, "Flood detected, closing");
                            close = true;
                            break;
                        }
                    }
                    trace!(conn_id = index, code = packet.header.msg_code, "Packet received");
                    self.inbound.push(Message { target, packet });
                }
            }
        }

        drop(io);
        if close {
            self.close_connection(&conn, generation);
        }
    }

    /// Continue a throttled write after the socket became writable.
    pub fn handle_writable(&self, index: usize) {
        let conn = match self.pool.get(index) {
            Some(conn) => conn,
            None => return,
        };
        let generation = conn.generation();
        let mut io = match conn.lock_current(generation) {
            Some(io) => io,
            None => return,
        };
        let frame = match io.pending_write.take() {
            Some(frame) => frame,
            None => return,
        };

        let failed = match write_frame(&mut io, frame) {
            Ok(WriteStatus::Blocked(rest)) => {
                io.pending_write = Some(rest);
                return;
            }
            Ok(WriteStatus::Complete) | Ok(WriteStatus::Zero) => false,
            Err(e) => {
                debug!(conn_id = index, error = %e, "Write failed");
                true
            }
        };

        if let Err(e) = io.modify_interest(&self.registry, index, Interest::WRITABLE, InterestMode::Clear) {
            warn!(conn_id = index, error = %e, "Failed to clear write interest");
        }
        drop(io);

        conn.dec_throttled();
        self.outbound.notify();
        if failed {
            self.close_connection(&conn, generation);
        }
    }

    /// Forget a throttled write after the peer hung up or errored.
    pub fn abandon_write(&self, index: usize) {
        let conn = match self.pool.get(index) {
            Some(conn) => conn,
            None => return,
        };
        let mut io = match conn.lock_current(conn.generation()) {
            Some(io) => io,
            None => return,
        };
        if io.pending_write.take().is_none() {
            return;
        }

        if let Err(e) = io.modify_interest(&self.registry, index, Interest::WRITABLE, InterestMode::Clear) {
            debug!(conn_id = index, error = %e, "Failed to clear write interest");
        }
        drop(io);

        conn.dec_throttled();
        self.outbound.notify();
        debug!(conn_id = index, "Dropped pending write after hangup");
    }

    /// Close the socket of `conn` if it still belongs to `generation` and
    /// schedule the slot for recycling.
    pub fn close_connection(&self, conn: &Connection, generation: u64) {
        let peer = {
            let mut io = match conn.lock_current(generation) {
                Some(io) => io,
                None => return,
            };
            if let Some(mut stream) = io.stream.take() {
                let _ = self.registry.deregister(&mut stream);
            }
            io.interest = None;
            io.peer
        };

        if self.heartbeat_enabled() {
            self.timers.lock().remove_connection(conn.index());
        }
        if self.pool.schedule_recycle(conn) {
            debug!(conn_id = conn.index(), peer = ?peer, "Connection closed");
        }
    }

    /// Queue `packet` for the connection `target`.
    pub fn send(&self, target: ConnRef, packet: &Packet) -> Enqueue {
        let conn = match self.pool.resolve(target) {
            Some(conn) => conn,
            None => {
                debug!(conn_id = target.index, "Not sending to stale connection");
                return Enqueue::Stale;
            }
        };

        if conn.queued_sends() > self.max_conn_backlog {
            let discarded = self.outbound.discard();
            warn!(
                conn_id = target.index,
                queued = conn.queued_sends(),
                discarded,
                "Connection send backlog exceeded, closing"
            );
            self.close_connection(&conn, target.generation);
            return Enqueue::Backlog;
        }

        self.outbound.push(Outgoing {
            target,
            conn,
            frame: packet.encode(),
        })
    }

    /// Run the handler registered for the packet's code.
    pub fn dispatch(&self, message: Message) {
        let conn = match self.pool.resolve(message.target) {
            Some(conn) => conn,
            None => {
                debug!(conn_id = message.target.index, "Dropping packet for stale connection");
                return;
            }
        };

        let code = message.packet.header.msg_code;
        let handler = match self.dispatcher.get(code) {
            Some(handler) => handler,
            None => {
                warn!(conn_id = message.target.index, code, "No handler for message code");
                return;
            }
        };

        if !handler.handle(&Request::new(self, &conn, &message)) {
            debug!(conn_id = message.target.index, code, "Handler reported failure");
        }
    }

    /// Apply the timeout policy to every timer due at `now`.
    pub fn process_timeouts(&self, now: Instant) {
        let expired = self.timers.lock().pop_expired(now);
        for target in expired {
            let conn = match self.pool.resolve(target) {
                Some(conn) => conn,
                None => {
                    trace!(conn_id = target.index, "Discarding stale timer");
                    continue;
                }
            };

            match self.policy.on_timeout(&conn, now) {
                TimeoutAction::Close => {
                    info!(conn_id = target.index, peer = ?conn.peer(), "Idle connection timed out");
                    self.close_connection(&conn, target.generation);
                }
                TimeoutAction::Recheck(deadline) => {
                    self.timers.lock().add(deadline, target);
                }
            }
        }
    }

    /// Body of the send thread.
    pub fn run_sender(&self) {
        loop {
            self.outbound.wait();
            if self.is_stopping() {
                break;
            }
            self.outbound.flush(&self.registry);
        }
        debug!("Send thread exiting");
    }

    /// Body of the recycle thread.
    pub fn run_recycler(&self) {
        while !self.shutdown.sleep(RECYCLE_INTERVAL) {
            let released = self.pool.sweep(Instant::now(), self.recycle_wait, false);
            if released > 0 {
                trace!(released, "Recycled connections");
            }
        }
        debug!("Recycle thread exiting");
    }

    /// Body of the timer thread.
    pub fn run_timer(&self) {
        while !self.shutdown.sleep(TIMER_INTERVAL) {
            self.process_timeouts(Instant::now());
        }
        debug!("Timer thread exiting");
    }

    /// Drop everything still queued and release all recycling slots.
    pub fn teardown(&self) {
        let outbound = self.outbound.clear();
        let timers = {
            let mut timers = self.timers.lock();
            let len = timers.len();
            timers.clear();
            len
        };
        let released = self.pool.sweep(Instant::now(), Duration::ZERO, true);
        debug!(outbound, timers, released, "Engine torn down");
    }

    pub fn log_stats(&self) {
        let pool = self.pool.stats();
        let inbound = self.inbound.queue_len();
        info!(
            online = pool.online,
            limit = self.worker_connections,
            free = pool.free,
            total = pool.total,
            recycling = pool.recycling,
            timers = self.timer_len(),
            inbound,
            outbound = self.outbound.len(),
            discarded = self.outbound.discarded(),
            "Worker statistics"
        );
        if inbound > INBOUND_BACKLOG_WARN {
            warn!(inbound, "Inbound queue backlog is high");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use mio::Poll;
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Counts its calls and answers with a fixed action.
    struct ScriptedPolicy {
        calls: Arc<AtomicUsize>,
        close: bool,
        wait: Duration,
    }

    impl TimeoutPolicy for ScriptedPolicy {
        fn on_timeout(&self, _conn: &Connection, now: Instant) -> TimeoutAction {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.close {
                TimeoutAction::Close
            } else {
                TimeoutAction::Recheck(now + self.wait)
            }
        }
    }

    fn heartbeat_config() -> Config {
        let mut config = Config {
            worker_connections: 4,
            ..Config::default()
        };
        config.heartbeat.enabled = true;
        config.heartbeat.wait_secs = 20;
        config
    }

    /// Returns the poll too; it owns the selector the registry points at.
    fn test_engine(config: &Config, policy: ScriptedPolicy) -> (Poll, Engine) {
        let poll = Poll::new().unwrap();
        let registry = poll.registry().try_clone().unwrap();
        let waker = Waker::new(poll.registry(), Token(usize::MAX)).unwrap();
        let engine = Engine::new(config, Dispatcher::with_size(1), Box::new(policy), registry, waker);
        (poll, engine)
    }

    /// Admit the server side of a loopback connection; the client is returned to keep it open.
    fn admit_loopback(engine: &Engine) -> (std::net::TcpStream, ConnRef) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let client = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        let target = engine.admit(TcpStream::from_std(server), peer, port).unwrap();
        (client, target)
    }

    #[test]
    fn test_due_timer_closes_connection() {
        let calls = Arc::new(AtomicUsize::new(0));
        let policy = ScriptedPolicy {
            calls: Arc::clone(&calls),
            close: true,
            wait: Duration::from_secs(5),
        };
        let config = heartbeat_config();
        let (_poll, engine) = test_engine(&config, policy);
        let start = Instant::now();
        let (_client, target) = admit_loopback(&engine);
        assert_eq!(engine.timer_len(), 1);

        engine.process_timeouts(start + Duration::from_secs(1));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(engine.pool().online(), 1);

        engine.process_timeouts(start + Duration::from_secs(21));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(engine.pool().resolve(target).is_none());
        let stats = engine.pool().stats();
        assert_eq!(stats.online, 0);
        assert_eq!(stats.recycling, 1);
        assert_eq!(engine.timer_len(), 0);
    }

    #[test]
    fn test_recheck_rearms_timer() {
        let calls = Arc::new(AtomicUsize::new(0));
        let wait = Duration::from_secs(5);
        let policy = ScriptedPolicy {
            calls: Arc::clone(&calls),
            close: false,
            wait,
        };
        let config = heartbeat_config();
        let (_poll, engine) = test_engine(&config, policy);
        let start = Instant::now();
        let (_client, target) = admit_loopback(&engine);

        let first = start + Duration::from_secs(21);
        engine.process_timeouts(first);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.timer_len(), 1);
        assert!(engine.pool().resolve(target).is_some());

        engine.process_timeouts(first + wait - Duration::from_millis(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.timer_len(), 1);

        engine.process_timeouts(first + wait);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(engine.timer_len(), 1);
        assert_eq!(engine.pool().online(), 1);
    }

    #[test]
    fn test_timer_for_recycled_connection_skips_policy() {
        let calls = Arc::new(AtomicUsize::new(0));
        let policy = ScriptedPolicy {
            calls: Arc::clone(&calls),
            close: true,
            wait: Duration::from_secs(5),
        };
        let config = heartbeat_config();
        let (_poll, engine) = test_engine(&config, policy);
        let start = Instant::now();
        let (_client, target) = admit_loopback(&engine);

        let conn = engine.pool().get(target.index).unwrap();
        assert!(engine.pool().schedule_recycle(&conn));
        assert_eq!(engine.timer_len(), 1);

        engine.process_timeouts(start + Duration::from_secs(21));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(engine.timer_len(), 0);
    }

    #[test]
    fn test_abandon_write_restores_read_interest() {
        let policy = ScriptedPolicy {
            calls: Arc::new(AtomicUsize::new(0)),
            close: true,
            wait: Duration::from_secs(5),
        };
        let config = Config {
            worker_connections: 4,
            ..Config::default()
        };
        let (_poll, engine) = test_engine(&config, policy);
        let (_client, target) = admit_loopback(&engine);
        let conn = engine.pool().get(target.index).unwrap();

        {
            let mut io = conn.io.lock();
            io.pending_write = Some(Bytes::from_static(b"tail"));
            io.modify_interest(&engine.registry, target.index, Interest::WRITABLE, InterestMode::Add)
                .unwrap();
            assert_eq!(io.interest, Some(Interest::READABLE | Interest::WRITABLE));
        }
        conn.inc_throttled();

        engine.abandon_write(target.index);
        assert_eq!(conn.throttled_writes(), 0);
        let io = conn.io.lock();
        assert!(io.pending_write.is_none());
        assert_eq!(io.interest, Some(Interest::READABLE));
        drop(io);

        // Nothing pending: a second call changes nothing.
        engine.abandon_write(target.index);
        assert_eq!(conn.throttled_writes(), 0);
        assert!(engine.pool().resolve(target).is_some());
    }
}
