//! CRC-32 (IEEE 802.3) checksum used for packet payloads.

use crc::{CRC_32_ISO_HDLC, Crc};

/// Reflected polynomial 0xEDB88320, init 0xFFFFFFFF, xorout 0xFFFFFFFF.
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Compute the CRC-32 of `data`.
pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}
