//! Message envelopes and the command dispatch table.

use crate::protocol::Packet;
use crate::runtime::connection::{ConnRef, Connection};
use crate::runtime::engine::Engine;
use crate::runtime::send::Enqueue;
use std::sync::Arc;

/// A packet plus the connection incarnation it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub target: ConnRef,
    pub packet: Packet,
}

/// Everything a handler gets to see about one incoming packet.
pub struct Request<'a> {
    engine: &'a Engine,
    conn: &'a Arc<Connection>,
    message: &'a Message,
}

impl<'a> Request<'a> {
    pub(crate) fn new(engine: &'a Engine, conn: &'a Arc<Connection>, message: &'a Message) -> Self {
        Self {
            engine,
            conn,
            message,
        }
    }

    pub fn code(&self) -> u16 {
        self.message.packet.header.msg_code
    }

    /// Packet body, `None` for a header-only packet.
    pub fn body(&self) -> Option<&'a [u8]> {
        self.message.packet.body()
    }

    pub fn conn(&self) -> &'a Connection {
        self.conn
    }

    pub fn target(&self) -> ConnRef {
        self.message.target
    }

    /// Send `body` back to the originating connection under `code`.
    pub fn reply(&self, code: u16, body: &[u8]) -> Enqueue {
        match Packet::new(code, body.to_vec()) {
            Some(packet) => self.engine.send(self.message.target, &packet),
            None => {
                self.engine.outbound().discard();
                Enqueue::QueueFull
            }
        }
    }

    /// Send a header-only packet back.
    pub fn reply_empty(&self, code: u16) -> Enqueue {
        self.engine.send(self.message.target, &Packet::empty(code))
    }

    /// Close the originating connection.
    pub fn close(&self) {
        self.engine.close_connection(self.conn, self.message.target.generation);
    }
}

/// Business logic for one command code.
///
/// The return value reports success for logging only.
pub trait Handler: Send + Sync {
    fn handle(&self, req: &Request<'_>) -> bool;
}

impl<F> Handler for F
where
    F: Fn(&Request<'_>) -> bool + Send + Sync,
{
    fn handle(&self, req: &Request<'_>) -> bool {
        self(req)
    }
}

/// Fixed-size table of handlers indexed by command code.
pub struct Dispatcher {
    handlers: Vec<Option<Box<dyn Handler>>>,
}

impl Dispatcher {
    /// Table accepting codes `0..size`.
    pub fn with_size(size: usize) -> Self {
        let mut handlers = Vec::with_capacity(size);
        handlers.resize_with(size, || None);
        Self { handlers }
    }

    /// Install `handler` for `code`. Codes outside the table are ignored.
    pub fn register(&mut self, code: u16, handler: impl Handler + 'static) -> &mut Self {
        if let Some(slot) = self.handlers.get_mut(code as usize) {
            *slot = Some(Box::new(handler));
        }
        self
    }

    pub fn get(&self, code: u16) -> Option<&dyn Handler> {
        self.handlers.get(code as usize)?.as_deref()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
