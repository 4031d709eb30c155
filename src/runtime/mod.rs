//! Network runtime of a worker process.
//!
//! - `reactor`: mio event loop, listeners and accept handling
//! - `engine`: shared worker state, read/write handlers, background thread bodies
//! - `pool`: connection slots with delayed recycling
//! - `recv`: receive state machine and flood detection
//! - `send`: outbound queue and partial-write continuation
//! - `threadpool`: business threads consuming the inbound queue
//! - `timer`: idle-connection timer queue and timeout policies

pub mod connection;
pub mod dispatch;
pub mod engine;
pub mod pool;
pub mod reactor;
pub mod recv;
pub mod send;
pub mod sync;
pub mod threadpool;
pub mod timer;
pub mod worker;

pub use connection::{ConnRef, Connection};
pub use dispatch::{Dispatcher, Handler, Message, Request};
pub use engine::Engine;
pub use timer::{HeartbeatPolicy, TimeoutAction, TimeoutPolicy};
pub use worker::{StopHandle, Worker};
