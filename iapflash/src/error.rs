//! Error types for iapflash.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for iapflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for iapflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error outside of an active transfer.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Record too short or otherwise ill-formed.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// CRC32 of a packet's data disagrees with its embedded checksum.
    #[error("CRC mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum carried by the packet.
        expected: u32,
        /// Checksum computed over the received data.
        actual: u32,
    },

    /// The target answered with NAK.
    #[error("Target rejected the transfer (NAK)")]
    TargetRejected,

    /// A control byte arrived that the session cannot act on in its state.
    #[error("Protocol violation: unexpected byte 0x{byte:02X} in state {state}")]
    ProtocolViolation {
        /// Session state at the time the byte arrived.
        state: String,
        /// The offending byte.
        byte: u8,
    },

    /// No control byte arrived within the deadline.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Writing to or reading from the transport failed during a transfer.
    #[error("Transport error: {0}")]
    Transport(#[source] io::Error),

    /// Reading the firmware image failed during a transfer.
    #[error("Firmware image error: {0}")]
    ImageSource(#[source] io::Error),

    /// The firmware image does not exist.
    #[error("Firmware image not found: {}", .0.display())]
    ImageNotFound(PathBuf),

    /// The firmware image exists but cannot be read.
    #[error("Permission denied reading firmware image: {}", .0.display())]
    ImageReadDenied(PathBuf),

    /// The firmware image is too short to hold the metadata record.
    #[error("Firmware image truncated: need {needed} bytes, image has {actual}")]
    ImageTruncated {
        /// Minimum image length required.
        needed: u64,
        /// Actual image length.
        actual: u64,
    },

    /// The firmware image does not fit the transfer header fields.
    #[error("Firmware image too large: {0} bytes")]
    ImageTooLarge(u64),

    /// The firmware image has no content to transfer.
    #[error("Firmware image is empty")]
    EmptyImage,

    /// `start` was called on a session that already left the idle state.
    #[error("Transfer session already started")]
    AlreadyStarted,

    /// The transfer was cancelled by the embedding application.
    #[error("Transfer cancelled")]
    Cancelled,

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}
