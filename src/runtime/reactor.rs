//! mio event loop.
//!
//! Readiness-based model: poll tells us when sockets are ready, then the
//! engine performs non-blocking reads and writes. Registrations are
//! edge-triggered, so every handler drains its socket until it would block.
//!
//! Connection tokens are pool slot indexes. Listener and waker tokens are
//! taken from the top of the token space.

use crate::runtime::engine::Engine;
use mio::event::Event;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{error, info, warn};

pub const WAKER_TOKEN: Token = Token(usize::MAX);

const EVENTS_CAPACITY: usize = 512;

struct Listener {
    port: u16,
    token: Token,
    listener: TcpListener,
}

/// What one call to [`Reactor::run_once`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    Processed(usize),
    TimedOut,
}

pub struct Reactor {
    poll: Poll,
    events: Events,
    listeners: Vec<Listener>,
}

impl Reactor {
    /// Create the poll instance and open one listener per port.
    pub fn bind(ports: &[u16]) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut listeners = Vec::with_capacity(ports.len());

        for (i, &port) in ports.iter().enumerate() {
            let addr = SocketAddr::from(([0, 0, 0, 0], port));
            let mut listener = TcpListener::from_std(create_listener_with_reuseport(addr)?);
            let token = Token(usize::MAX - 1 - i);
            poll.registry()
                .register(&mut listener, token, Interest::READABLE)?;

            let local = listener.local_addr()?;
            let port = local.port();
            info!(addr = %local, "Listening");
            listeners.push(Listener {
                port,
                token,
                listener,
            });
        }

        Ok(Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            listeners,
        })
    }

    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    pub fn waker(&self) -> io::Result<Waker> {
        Waker::new(self.poll.registry(), WAKER_TOKEN)
    }

    /// Bound addresses, in port order.
    pub fn local_addrs(&self) -> io::Result<Vec<SocketAddr>> {
        self.listeners
            .iter()
            .map(|l| l.listener.local_addr())
            .collect()
    }

    /// Wait for readiness once and dispatch every event.
    pub fn run_once(&mut self, engine: &Engine, timeout: Option<Duration>) -> io::Result<PollStatus> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                return Ok(PollStatus::Processed(0));
            }
            Err(e) => return Err(e),
        }

        if self.events.is_empty() {
            return Ok(match timeout {
                Some(_) => PollStatus::TimedOut,
                None => PollStatus::Processed(0),
            });
        }

        let mut processed = 0;
        for event in self.events.iter() {
            processed += 1;
            let token = event.token();
            if token == WAKER_TOKEN {
                continue;
            }
            if let Some(listener) = self.listeners.iter().find(|l| l.token == token) {
                accept_connections(listener, engine);
                continue;
            }
            handle_connection_event(engine, token.0, event);
        }

        Ok(PollStatus::Processed(processed))
    }
}

fn accept_connections(listener: &Listener, engine: &Engine) {
    loop {
        match listener.listener.accept() {
            Ok((stream, peer)) => {
                engine.admit(stream, peer, listener.port);
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!(port = listener.port, error = %e, "Accept error");
                break;
            }
        }
    }
}

fn handle_connection_event(engine: &Engine, index: usize, event: &Event) {
    if event.is_readable() || event.is_read_closed() || event.is_error() {
        engine.handle_readable(index);
    }

    if event.is_writable() {
        if event.is_error() || event.is_write_closed() {
            engine.abandon_write(index);
        } else {
            engine.handle_writable(index);
        }
    }
}

/// Create a TCP listener with SO_REUSEPORT so every worker process can bind the same port.
fn create_listener_with_reuseport(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_port(true)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    if let Err(e) = socket.bind(&addr.into()) {
        warn!(addr = %addr, error = %e, "Bind failed");
        return Err(e);
    }
    socket.listen(1024)?;

    Ok(socket.into())
}
