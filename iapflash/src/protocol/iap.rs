//! IAP bootloader wire format.
//!
//! Every record sent by the initiator is preceded by a single START marker
//! byte. The target answers each record with a single control byte.
//!
//! ```text
//! Transfer header (sent once):
//! +-----+------------+-------------+
//! | SOH | total size | chunk count |
//! +-----+------------+-------------+
//! |  1  |   u32 LE   |   u16 LE    |
//! +-----+------------+-------------+
//!
//! Data packet:
//! +-----+----------+--------+-------------------+
//! | SOH | sequence | CRC32  |  data (1..=1024)  |
//! +-----+----------+--------+-------------------+
//! |  1  |  u32 LE  | u32 LE |     variable      |
//! +-----+----------+--------+-------------------+
//! ```
//!
//! The checksum covers exactly the data bytes that follow it on the wire.

use crate::error::{Error, Result};
use crate::protocol::crc::crc32;
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use std::fmt;
use std::time::Duration;

/// IAP control characters.
pub mod control {
    /// Acknowledge: proceed / success.
    pub const ACK: u8 = 0xAB;
    /// Not acknowledge: reject / abort.
    pub const NAK: u8 = 0xAC;
    /// Query (reserved).
    pub const QRY: u8 = 0xAD;
    /// Info (reserved).
    pub const INF: u8 = 0xAE;
    /// Start of frame, precedes every header and packet.
    pub const SOH: u8 = 0xAF;
}

/// Maximum number of data bytes carried by one packet.
pub const MAX_PACKET_SIZE: usize = 1024;

/// Timeout waiting for the target to answer the transfer header. The target
/// erases its application area before it acknowledges.
pub const HEADER_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout waiting for the target to answer a data packet.
pub const TRANSFER_TIMEOUT: Duration = Duration::from_millis(100);

/// Decoded control byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlByte {
    /// Proceed / success.
    Ack = control::ACK,
    /// Reject / abort.
    Nak = control::NAK,
    /// Reserved query code.
    Query = control::QRY,
    /// Reserved info code.
    Info = control::INF,
    /// Start-of-frame marker.
    StartOfFrame = control::SOH,
}

impl ControlByte {
    /// Decode a raw byte, returning `None` for bytes outside the control set.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            control::ACK => Some(Self::Ack),
            control::NAK => Some(Self::Nak),
            control::QRY => Some(Self::Query),
            control::INF => Some(Self::Info),
            control::SOH => Some(Self::StartOfFrame),
            _ => None,
        }
    }

    /// Raw byte value.
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ControlByte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ack => "ACK",
            Self::Nak => "NAK",
            Self::Query => "QRY",
            Self::Info => "INF",
            Self::StartOfFrame => "SOH",
        };
        write!(f, "{name} (0x{:02X})", self.as_u8())
    }
}

/// Transfer header announcing the image size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct TransferHeader {
    /// Image size in bytes.
    pub total_size: u32,
    /// Number of full chunks; a trailing partial chunk is not counted.
    pub chunk_count: u16,
}

impl TransferHeader {
    /// Encoded size in bytes.
    pub const SIZE: usize = 6;

    /// Create a header from raw field values.
    pub fn new(total_size: u32, chunk_count: u16) -> Self {
        Self {
            total_size,
            chunk_count,
        }
    }

    /// Compute the header for an image of `total_len` bytes.
    ///
    /// `chunk_count` is `floor(total_len / max_chunk)`, so an image whose
    /// length is not a multiple of the chunk size announces one chunk less
    /// than the number of packets actually sent.
    pub fn for_image(total_len: u64, max_chunk: usize) -> Result<Self> {
        if !(1..=MAX_PACKET_SIZE).contains(&max_chunk) {
            return Err(Error::Config(format!(
                "chunk size must be between 1 and {MAX_PACKET_SIZE}, got {max_chunk}"
            )));
        }
        let total_size = u32::try_from(total_len).map_err(|_| Error::ImageTooLarge(total_len))?;
        let chunk_count = u16::try_from(u64::from(total_size) / max_chunk as u64)
            .map_err(|_| Error::ImageTooLarge(total_len))?;
        Ok(Self::new(total_size, chunk_count))
    }

    /// Number of packets a session sends for this header, including a
    /// trailing partial chunk. A zero chunk size sends nothing.
    pub fn packet_count(&self, max_chunk: usize) -> u32 {
        match u32::try_from(max_chunk) {
            Ok(0) => 0,
            Ok(chunk) => self.total_size.div_ceil(chunk),
            // Any u32 image fits in one chunk.
            Err(_) => u32::from(self.total_size > 0),
        }
    }

    /// Serialize to the 6-byte wire layout.
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        LittleEndian::write_u32(&mut buf[0..4], self.total_size);
        LittleEndian::write_u16(&mut buf[4..6], self.chunk_count);
        buf
    }

    /// Parse from the wire layout.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::MalformedFrame(format!(
                "transfer header needs {} bytes, got {}",
                Self::SIZE,
                bytes.len()
            )));
        }
        let mut reader = bytes;
        let total_size = reader.read_u32::<LittleEndian>()?;
        let chunk_count = reader.read_u16::<LittleEndian>()?;
        Ok(Self::new(total_size, chunk_count))
    }
}

/// One chunk of the image with its sequence number and checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    /// Sequence number, starting at 1.
    pub sequence: u32,
    /// CRC32 of `data`.
    pub checksum: u32,
    /// Payload bytes.
    pub data: Vec<u8>,
}

impl DataPacket {
    /// Length of the sequence and checksum fields.
    pub const HEADER_LEN: usize = 8;

    /// Build a packet, computing the checksum over `data`.
    pub fn new(sequence: u32, data: Vec<u8>) -> Self {
        Self {
            sequence,
            checksum: crc32(&data),
            data,
        }
    }

    /// Encoded length on the wire (without the START marker).
    pub fn encoded_len(&self) -> usize {
        Self::HEADER_LEN + self.data.len()
    }

    /// Serialize as `sequence || checksum || data`.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.encoded_len()];
        LittleEndian::write_u32(&mut buf[0..4], self.sequence);
        LittleEndian::write_u32(&mut buf[4..8], self.checksum);
        buf[Self::HEADER_LEN..].copy_from_slice(&self.data);
        buf
    }

    /// Parse a packet whose data field must be exactly `expected_len` bytes,
    /// verifying its checksum.
    pub fn decode(bytes: &[u8], expected_len: usize) -> Result<Self> {
        if bytes.len() < Self::HEADER_LEN {
            return Err(Error::MalformedFrame(format!(
                "data packet needs at least {} bytes, got {}",
                Self::HEADER_LEN,
                bytes.len()
            )));
        }
        let data_len = bytes.len() - Self::HEADER_LEN;
        if data_len != expected_len {
            return Err(Error::MalformedFrame(format!(
                "data packet carries {data_len} bytes, expected {expected_len}"
            )));
        }

        let mut reader = bytes;
        let sequence = reader.read_u32::<LittleEndian>()?;
        let checksum = reader.read_u32::<LittleEndian>()?;
        let data = reader.to_vec();

        let actual = crc32(&data);
        if actual != checksum {
            return Err(Error::ChecksumMismatch {
                expected: checksum,
                actual,
            });
        }

        Ok(Self {
            sequence,
            checksum,
            data,
        })
    }
}

/// Encode a transfer header.
pub fn encode_header(total_size: u32, chunk_count: u16) -> [u8; TransferHeader::SIZE] {
    TransferHeader::new(total_size, chunk_count).encode()
}

/// Decode a transfer header.
pub fn decode_header(bytes: &[u8]) -> Result<TransferHeader> {
    TransferHeader::decode(bytes)
}

/// Encode a data packet, checksumming exactly `data`.
pub fn encode_packet(sequence: u32, data: &[u8]) -> Vec<u8> {
    DataPacket::new(sequence, data.to_vec()).encode()
}

/// Decode and verify a data packet.
pub fn decode_packet(bytes: &[u8], expected_len: usize) -> Result<DataPacket> {
    DataPacket::decode(bytes, expected_len)
}

/// Prefix a record with the START marker so both go out in one write.
pub fn frame(record: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + record.len());
    buf.push(control::SOH);
    buf.extend_from_slice(record);
    buf
}
