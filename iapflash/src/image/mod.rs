//! Firmware image handling.

pub mod firmware;

pub use firmware::{Chunks, FW_META_OFFSET, FW_META_SIZE, FirmwareImage, FirmwareMetadata};
