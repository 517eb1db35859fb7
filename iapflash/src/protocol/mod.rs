//! Protocol implementations.

pub mod crc;
pub mod iap;

// Re-export common types
pub use iap::{
    ControlByte, DataPacket, MAX_PACKET_SIZE, TransferHeader, control, decode_header,
    decode_packet, encode_header, encode_packet, frame,
};
