//! packet-server: a multi-process TCP server engine.
//!
//! Clients speak a length-prefixed binary protocol with a CRC-32 over each
//! body (see [`protocol`]). Each worker process runs a mio reactor, a pool
//! of business threads fed by an inbound queue, and a send thread draining
//! an outbound queue. Closed connections are recycled after a delay and
//! idle ones are reaped by a timer thread.

pub mod checksum;
pub mod config;
pub mod logic;
pub mod process;
pub mod protocol;
pub mod runtime;
