//! Per-connection receive state machine.
//!
//! Bytes arrive in arbitrary fragments. The assembler hands out the slice
//! the next read should fill, then advances by however many bytes the read
//! produced:
//!
//! ```text
//! HeaderInit --partial--> HeaderPartial --complete--> (validate length)
//!     ^                                                   |
//!     |                          no body: finalize <------+------> BodyInit
//!     |                                                             |
//!     +------------- finalize <--complete-- BodyPartial <--partial--+
//! ```
//!
//! Length violations and checksum mismatches discard the packet and reset
//! to `HeaderInit`; the connection itself is left alone.

use crate::protocol::{Packet, PacketHeader, HEADER_LEN};
use bytes::Bytes;
use std::time::{Duration, Instant};

/// Receive state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvState {
    /// Waiting for the first byte of a header.
    HeaderInit,
    /// Part of the header has arrived.
    HeaderPartial,
    /// Header accepted, no body byte yet.
    BodyInit,
    /// Part of the body has arrived.
    BodyPartial,
}

/// Why an assembled packet was thrown away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discard {
    /// Declared length below the header size or above the configured limit.
    BadLength(u16),
    /// Body does not match the declared checksum.
    ChecksumMismatch { declared: u32, computed: u32 },
}

/// Outcome of advancing the assembler.
#[derive(Debug, PartialEq, Eq)]
pub enum Step {
    /// More bytes are needed.
    Pending,
    /// A full, verified packet.
    Complete(Packet),
    /// The packet was rejected; the assembler is back at `HeaderInit`.
    Discarded(Discard),
}

/// Accumulates one packet at a time.
#[derive(Debug)]
pub struct PacketAssembler {
    state: RecvState,
    header_buf: [u8; HEADER_LEN],
    header: Option<PacketHeader>,
    body: Vec<u8>,
    /// Bytes received in the current phase.
    filled: usize,
    max_packet_len: u16,
}

impl PacketAssembler {
    pub fn new(max_packet_len: u16) -> Self {
        Self {
            state: RecvState::HeaderInit,
            header_buf: [0; HEADER_LEN],
            header: None,
            body: Vec::new(),
            filled: 0,
            max_packet_len,
        }
    }

    pub fn state(&self) -> RecvState {
        self.state
    }

    /// Bytes still missing from the current phase.
    pub fn remaining(&self) -> usize {
        match self.state {
            RecvState::HeaderInit | RecvState::HeaderPartial => HEADER_LEN - self.filled,
            RecvState::BodyInit | RecvState::BodyPartial => self.body.len() - self.filled,
        }
    }

    /// Slice the next read should write into.
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        match self.state {
            RecvState::HeaderInit | RecvState::HeaderPartial => &mut self.header_buf[self.filled..],
            RecvState::BodyInit | RecvState::BodyPartial => &mut self.body[self.filled..],
        }
    }

    /// Account for `n` bytes just written into [`buffer_mut`](Self::buffer_mut).
    pub fn advance(&mut self, n: usize) -> Step {
        debug_assert!(n > 0 && n <= self.remaining());

        if n < self.remaining() {
            self.filled += n;
            self.state = match self.state {
                RecvState::HeaderInit | RecvState::HeaderPartial => RecvState::HeaderPartial,
                RecvState::BodyInit | RecvState::BodyPartial => RecvState::BodyPartial,
            };
            return Step::Pending;
        }

        match self.state {
            RecvState::HeaderInit | RecvState::HeaderPartial => self.header_complete(),
            RecvState::BodyInit | RecvState::BodyPartial => self.body_complete(),
        }
    }

    /// Drop any partial packet.
    pub fn reset(&mut self) {
        self.state = RecvState::HeaderInit;
        self.header = None;
        self.body = Vec::new();
        self.filled = 0;
    }

    fn header_complete(&mut self) -> Step {
        let header = PacketHeader::decode(&self.header_buf);

        if (header.pkg_len as usize) < HEADER_LEN || header.pkg_len > self.max_packet_len {
            self.reset();
            return Step::Discarded(Discard::BadLength(header.pkg_len));
        }

        if header.body_len() == 0 {
            self.reset();
            return finalize(Packet {
                header,
                body: Bytes::new(),
            });
        }

        self.header = Some(header);
        self.body = vec![0u8; header.body_len()];
        self.filled = 0;
        self.state = RecvState::BodyInit;
        Step::Pending
    }

    fn body_complete(&mut self) -> Step {
        let body = std::mem::take(&mut self.body);
        let header = self.header.take();
        self.reset();

        match header {
            Some(header) => finalize(Packet {
                header,
                body: Bytes::from(body),
            }),
            None => Step::Pending,
        }
    }
}

fn finalize(packet: Packet) -> Step {
    if packet.checksum_matches() {
        return Step::Complete(packet);
    }
    Step::Discarded(Discard::ChecksumMismatch {
        declared: packet.header.crc32,
        computed: crate::checksum::checksum(&packet.body),
    })
}

/// Flood heuristic: counts consecutive packets arriving closer together
/// than the configured interval.
#[derive(Debug, Clone)]
pub struct FloodGuard {
    last_arrival: Instant,
    fast_count: u32,
}

impl FloodGuard {
    /// Start tracking from `now`, normally the moment the connection was accepted.
    pub fn new(now: Instant) -> Self {
        Self {
            last_arrival: now,
            fast_count: 0,
        }
    }

    /// Record a packet arrival. Returns `true` once the connection should be closed.
    pub fn record(&mut self, now: Instant, interval: Duration, kick_count: u32) -> bool {
        let gap = now.saturating_duration_since(self.last_arrival);
        if gap.as_millis() < interval.as_millis() {
            self.fast_count += 1;
        } else {
            self.fast_count = 0;
        }
        self.last_arrival = now;
        self.fast_count >= kick_count
    }

    pub fn fast_count(&self) -> u32 {
        self.fast_count
    }
}
