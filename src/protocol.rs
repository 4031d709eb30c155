//! Wire format of the packet protocol.
//!
//! Every packet starts with a fixed 8-byte header in network byte order:
//!
//! ```text
//! +-----------+-----------+---------------------+
//! | msg_code  | pkg_len   | crc32               |
//! | u16       | u16       | u32                 |
//! +-----------+-----------+---------------------+
//! | body: pkg_len - 8 bytes, opaque              |
//! +----------------------------------------------+
//! ```
//!
//! `pkg_len` counts the header plus the body. `crc32` covers the body only
//! and must be 0 for a packet without a body.

use crate::checksum::checksum;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the wire header in bytes.
pub const HEADER_LEN: usize = 8;

/// Decoded wire header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Command code, index into the dispatch table.
    pub msg_code: u16,
    /// Header plus body length.
    pub pkg_len: u16,
    /// Checksum of the body, 0 when there is none.
    pub crc32: u32,
}

impl PacketHeader {
    /// Build the header describing `body`.
    ///
    /// Returns `None` when the packet would not fit the 16-bit length field.
    pub fn for_body(msg_code: u16, body: &[u8]) -> Option<Self> {
        let pkg_len = u16::try_from(HEADER_LEN + body.len()).ok()?;
        let crc32 = if body.is_empty() { 0 } else { checksum(body) };
        Some(Self {
            msg_code,
            pkg_len,
            crc32,
        })
    }

    /// Parse a header from its wire bytes.
    pub fn decode(mut buf: &[u8]) -> Self {
        debug_assert!(buf.len() >= HEADER_LEN);
        Self {
            msg_code: buf.get_u16(),
            pkg_len: buf.get_u16(),
            crc32: buf.get_u32(),
        }
    }

    /// Append the wire representation to `out`.
    pub fn encode(&self, out: &mut impl BufMut) {
        out.put_u16(self.msg_code);
        out.put_u16(self.pkg_len);
        out.put_u32(self.crc32);
    }

    /// Declared body length; 0 for malformed lengths below the header size.
    pub fn body_len(&self) -> usize {
        (self.pkg_len as usize).saturating_sub(HEADER_LEN)
    }
}

/// A complete packet: header plus body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub body: Bytes,
}

impl Packet {
    /// Build a packet, computing length and checksum from `body`.
    pub fn new(msg_code: u16, body: impl Into<Bytes>) -> Option<Self> {
        let body = body.into();
        let header = PacketHeader::for_body(msg_code, &body)?;
        Some(Self { header, body })
    }

    /// A packet carrying only a header.
    pub fn empty(msg_code: u16) -> Self {
        Self {
            header: PacketHeader {
                msg_code,
                pkg_len: HEADER_LEN as u16,
                crc32: 0,
            },
            body: Bytes::new(),
        }
    }

    /// Body as passed to business handlers: `None` when there is no body.
    pub fn body(&self) -> Option<&[u8]> {
        if self.body.is_empty() {
            None
        } else {
            Some(&self.body)
        }
    }

    /// Check the declared checksum against the body.
    ///
    /// A body-less packet is valid only with a zero checksum.
    pub fn checksum_matches(&self) -> bool {
        if self.body.is_empty() {
            self.header.crc32 == 0
        } else {
            checksum(&self.body) == self.header.crc32
        }
    }

    /// Serialize header and body into one contiguous frame.
    pub fn encode(&self) -> Bytes {
        let mut frame = BytesMut::with_capacity(HEADER_LEN + self.body.len());
        self.header.encode(&mut frame);
        frame.extend_from_slice(&self.body);
        frame.freeze()
    }
}
