//! One worker: reactor thread plus business, send, recycle and timer threads.

use crate::config::Config;
use crate::runtime::dispatch::Dispatcher;
use crate::runtime::engine::Engine;
use crate::runtime::reactor::Reactor;
use crate::runtime::timer::TimeoutPolicy;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{error, info};

const POLL_TIMEOUT: Duration = Duration::from_secs(1);
const STATS_INTERVAL: Duration = Duration::from_secs(10);

/// Cloneable handle that stops a running [`Worker`].
#[derive(Clone)]
pub struct StopHandle {
    engine: Arc<Engine>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.engine.request_stop();
    }
}

pub struct Worker {
    engine: Arc<Engine>,
    reactor: Reactor,
    threads: Vec<JoinHandle<()>>,
}

impl Worker {
    /// Open the listeners and start every background thread.
    pub fn start(
        config: &Config,
        dispatcher: Dispatcher,
        policy: Box<dyn TimeoutPolicy>,
    ) -> io::Result<Self> {
        let reactor = Reactor::bind(&config.ports)?;
        let registry = reactor.registry().try_clone()?;
        let waker = reactor.waker()?;
        let engine = Arc::new(Engine::new(config, dispatcher, policy, registry, waker));

        let mut worker = Worker {
            engine: Arc::clone(&engine),
            reactor,
            threads: Vec::new(),
        };

        let handler_engine = Arc::clone(&engine);
        if let Err(e) = engine
            .inbound()
            .start(config.worker_threads, move |msg| handler_engine.dispatch(msg))
        {
            worker.shutdown();
            return Err(e);
        }

        if let Err(e) = worker.spawn_background(config.heartbeat.enabled) {
            worker.shutdown();
            return Err(e);
        }

        info!(
            threads = config.worker_threads,
            connections = config.worker_connections,
            heartbeat = config.heartbeat.enabled,
            flood = config.flood.enabled,
            "Worker started"
        );
        Ok(worker)
    }

    fn spawn_background(&mut self, with_timer: bool) -> io::Result<()> {
        let engine = Arc::clone(&self.engine);
        self.threads.push(
            thread::Builder::new()
                .name("send".to_string())
                .spawn(move || engine.run_sender())?,
        );

        let engine = Arc::clone(&self.engine);
        self.threads.push(
            thread::Builder::new()
                .name("recycle".to_string())
                .spawn(move || engine.run_recycler())?,
        );

        if with_timer {
            let engine = Arc::clone(&self.engine);
            self.threads.push(
                thread::Builder::new()
                    .name("timer".to_string())
                    .spawn(move || engine.run_timer())?,
            );
        }
        Ok(())
    }

    pub fn local_addrs(&self) -> io::Result<Vec<SocketAddr>> {
        self.reactor.local_addrs()
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            engine: Arc::clone(&self.engine),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Run the event loop until stopped, then tear everything down.
    pub fn run(mut self) -> io::Result<()> {
        let mut last_stats = Instant::now();
        let mut result = Ok(());

        while !self.engine.is_stopping() {
            if let Err(e) = self.reactor.run_once(&self.engine, Some(POLL_TIMEOUT)) {
                error!(error = %e, "Event loop failed");
                result = Err(e);
                break;
            }

            if last_stats.elapsed() >= STATS_INTERVAL {
                self.engine.log_stats();
                last_stats = Instant::now();
            }
        }

        self.shutdown();
        info!("Worker stopped");
        result
    }

    fn shutdown(&mut self) {
        self.engine.inbound().stop_all();
        self.engine.request_stop();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        self.engine.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::checksum;
    use crate::logic;
    use crate::protocol::{Packet, PacketHeader, HEADER_LEN};
    use crate::runtime::dispatch::Request;
    use crate::runtime::send::Enqueue;
    use crate::runtime::timer::HeartbeatPolicy;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const BULK_CODE: u16 = 1;
    const BULK_FRAMES: usize = 40;
    const BULK_LEN: usize = 60_000;

    static BACKLOG_HITS: AtomicUsize = AtomicUsize::new(0);

    /// Answers with frames far larger than a socket buffer takes in one write.
    fn reply_bulk(req: &Request<'_>) -> bool {
        (0..BULK_FRAMES).all(|i| req.reply(BULK_CODE, &vec![i as u8; BULK_LEN]) == Enqueue::Queued)
    }

    /// Keeps replying until the connection's send backlog is exceeded.
    fn reply_until_rejected(req: &Request<'_>) -> bool {
        let body = vec![0xabu8; BULK_LEN];
        for _ in 0..1000 {
            match req.reply(BULK_CODE, &body) {
                Enqueue::Queued => {}
                Enqueue::Backlog => {
                    BACKLOG_HITS.fetch_add(1, Ordering::SeqCst);
                    return false;
                }
                _ => return false,
            }
        }
        true
    }

    fn test_config() -> Config {
        Config {
            ports: vec![0],
            worker_threads: 2,
            worker_connections: 16,
            single_process: true,
            ..Config::default()
        }
    }

    fn start(config: &Config) -> (SocketAddr, StopHandle, thread::JoinHandle<io::Result<()>>) {
        let (addr, _engine, stop, handle) = start_with(config, logic::dispatcher());
        (addr, stop, handle)
    }

    fn start_with(
        config: &Config,
        dispatcher: Dispatcher,
    ) -> (SocketAddr, Arc<Engine>, StopHandle, thread::JoinHandle<io::Result<()>>) {
        let policy = HeartbeatPolicy::new(config.heartbeat_wait(), config.heartbeat.kick_on_timeout);
        let worker = Worker::start(config, dispatcher, Box::new(policy)).unwrap();
        let engine = Arc::clone(worker.engine());
        let port = worker.local_addrs().unwrap()[0].port();
        let stop = worker.stop_handle();
        let handle = thread::spawn(move || worker.run());
        (SocketAddr::from(([127, 0, 0, 1], port)), engine, stop, handle)
    }

    fn bulk_dispatcher(handler: fn(&Request<'_>) -> bool) -> Dispatcher {
        let mut dispatcher = Dispatcher::with_size(2);
        dispatcher.register(BULK_CODE, handler);
        dispatcher
    }

    fn read_packet(stream: &mut TcpStream) -> Packet {
        let mut header = [0u8; HEADER_LEN];
        stream.read_exact(&mut header).unwrap();
        let header = PacketHeader::decode(&header);
        let mut body = vec![0u8; header.body_len()];
        stream.read_exact(&mut body).unwrap();
        Packet {
            header,
            body: body.into(),
        }
    }

    #[test]
    fn test_login_round_trip() {
        let (addr, stop, handle) = start(&test_config());
        let mut client = TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let mut body = Vec::new();
        body.extend_from_slice(&42u32.to_be_bytes());
        body.extend_from_slice(&7u64.to_be_bytes());
        let request = Packet::new(logic::CMD_LOGIN, body.clone()).unwrap();
        assert_eq!(request.header.pkg_len, 20);
        client.write_all(&request.encode()).unwrap();

        let reply = read_packet(&mut client);
        assert_eq!(reply.header.msg_code, logic::CMD_LOGIN);
        assert_eq!(reply.header.pkg_len, 20);
        assert_eq!(reply.header.crc32, checksum(&reply.body));
        assert_eq!(&reply.body[..], &body[..]);

        stop.stop();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_fragmented_ping_and_bad_packet() {
        let (addr, stop, handle) = start(&test_config());
        let mut client = TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        // Length below the header size is skipped without closing.
        client.write_all(&[0, 0, 0, 4, 0, 0, 0, 0]).unwrap();

        let ping = Packet::empty(logic::CMD_PING).encode();
        for byte in ping.iter() {
            client.write_all(&[*byte]).unwrap();
            thread::sleep(Duration::from_millis(2));
        }

        let reply = read_packet(&mut client);
        assert_eq!(reply.header.msg_code, logic::CMD_PING);
        assert_eq!(reply.header.pkg_len as usize, HEADER_LEN);
        assert_eq!(reply.header.crc32, 0);

        stop.stop();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_flood_closes_connection() {
        let mut config = test_config();
        config.flood.enabled = true;
        config.flood.interval_ms = 10_000;
        config.flood.kick_count = 3;
        let (addr, stop, handle) = start(&config);

        let mut client = TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let ping = Packet::empty(logic::CMD_PING).encode();
        for _ in 0..3 {
            client.write_all(&ping).unwrap();
        }

        // The first two pings are answered, then the server hangs up.
        let mut received = Vec::new();
        let _ = client.read_to_end(&mut received);
        assert!(received.len() <= 2 * HEADER_LEN);

        stop.stop();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_closed_connection_is_recycled() {
        let mut config = test_config();
        config.recycle.wait_secs = 0;
        let policy = HeartbeatPolicy::new(config.heartbeat_wait(), false);
        let worker = Worker::start(&config, logic::dispatcher(), Box::new(policy)).unwrap();
        let engine = Arc::clone(worker.engine());
        let port = worker.local_addrs().unwrap()[0].port();
        let stop = worker.stop_handle();
        let handle = thread::spawn(move || worker.run());

        let client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while engine.pool().online() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(engine.pool().online(), 1);

        drop(client);
        while engine.pool().stats().free < config.worker_connections && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        let stats = engine.pool().stats();
        assert_eq!(stats.online, 0);
        assert_eq!(stats.free, stats.total);

        stop.stop();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_large_replies_arrive_in_order() {
        let (addr, _engine, stop, handle) = start_with(&test_config(), bulk_dispatcher(reply_bulk));
        let mut client = TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        client.write_all(&Packet::empty(BULK_CODE).encode()).unwrap();

        // Let the socket buffers fill so the later frames have to wait for write readiness.
        thread::sleep(Duration::from_millis(200));

        for i in 0..BULK_FRAMES {
            let reply = read_packet(&mut client);
            assert_eq!(reply.header.msg_code, BULK_CODE);
            assert_eq!(reply.header.pkg_len as usize, HEADER_LEN + BULK_LEN);
            assert_eq!(reply.header.crc32, checksum(&reply.body));
            assert!(reply.body.iter().all(|&b| b == i as u8), "frame {i} out of order");
        }

        stop.stop();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_send_backlog_closes_connection() {
        let mut config = test_config();
        config.send.max_conn_backlog = 5;
        let (addr, engine, stop, handle) = start_with(&config, bulk_dispatcher(reply_until_rejected));

        // The client never reads, so the replies pile up.
        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(&Packet::empty(BULK_CODE).encode()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while (BACKLOG_HITS.load(Ordering::SeqCst) == 0 || engine.pool().online() > 0)
            && Instant::now() < deadline
        {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(BACKLOG_HITS.load(Ordering::SeqCst) >= 1);
        assert!(engine.outbound().discarded() >= 1);
        assert_eq!(engine.pool().online(), 0);

        drop(client);
        stop.stop();
        handle.join().unwrap().unwrap();
    }
}
