//! # iapflash
//!
//! A library for updating firmware over an IAP serial bootloader.
//!
//! The protocol is deliberately small: the host announces the image size,
//! then streams fixed-size chunks, each carrying a sequence number and a
//! CRC32, and waits for a single ACK or NAK byte from the target between
//! frames.
//!
//! This crate provides:
//!
//! - the IAP wire format (`TransferHeader`, `DataPacket`, control bytes)
//! - CRC-32 checksums for packet payloads
//! - a firmware image source with embedded version metadata
//! - the `TransferSession` state machine and a blocking `IapFlasher`
//!
//! ## Features
//!
//! - `native` (default): Native serial port support via the `serialport` crate
//! - `serde`: Serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use iapflash::{FirmwareImage, NoopSink};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut image = FirmwareImage::open("app.bin")?;
//!     println!("Firmware version {}", image.read_metadata()?);
//!
//!     #[cfg(feature = "native")]
//!     {
//!         use iapflash::{IapFlasher, NativePort};
//!
//!         let port = NativePort::open_simple("/dev/ttyUSB0", 115200)?;
//!         let mut flasher = IapFlasher::new(port);
//!         let report = flasher.flash(image, NoopSink)?;
//!         println!("Sent {} packets", report.packets_sent);
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod error;
pub mod flasher;
pub mod image;
pub mod port;
pub mod protocol;
pub mod session;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications).
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

#[cfg(test)]
pub(crate) fn test_set_interrupted(value: bool) {
    use std::sync::atomic::{AtomicBool, Ordering};

    static TEST_INTERRUPT_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

    let flag = TEST_INTERRUPT_FLAG
        .get_or_init(|| {
            let shared = Arc::new(AtomicBool::new(false));
            let checker = Arc::clone(&shared);
            set_interrupt_checker(move || checker.load(Ordering::Relaxed));
            shared
        })
        .clone();

    flag.store(value, Ordering::Relaxed);
}

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::{NativePort, NativePortEnumerator};
pub use {
    error::{Error, Result},
    flasher::{IapFlasher, TransferReport},
    image::firmware::{FW_META_OFFSET, FW_META_SIZE, FirmwareImage, FirmwareMetadata},
    port::{DataBits, FlowControl, Parity, Port, PortEnumerator, PortInfo, SerialConfig, StopBits},
    protocol::iap::{ControlByte, DataPacket, MAX_PACKET_SIZE, TransferHeader},
    session::{
        NoopSink, ProgressSink, SessionConfig, SessionState, TransferSession, UnknownBytePolicy,
    },
};
