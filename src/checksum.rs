//! Packet body checksum.
//!
//! Reflected CRC-32 over polynomial 0x04C11DB7 with an all-ones initial
//! value and final xor, i.e. the common "CRC-32" used by zlib and Ethernet.

use crc::{Crc, CRC_32_ISO_HDLC};

const CHECKSUM_ALGO: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Compute the checksum of a packet body.
pub fn checksum(bytes: &[u8]) -> u32 {
    CHECKSUM_ALGO.checksum(bytes)
}
