//! Blocking transfer driver.
//!
//! [`IapFlasher`] owns an open port, starts a [`TransferSession`] and keeps
//! polling it until the target completes or rejects the transfer.

use {
    crate::{
        error::{Error, Result},
        image::firmware::FirmwareImage,
        is_interrupted_requested,
        port::Port,
        session::{ProgressSink, SessionConfig, SessionState, TransferSession},
    },
    log::{debug, info, warn},
    std::{
        io::{self, Read, Seek},
        time::{Duration, Instant},
    },
};

/// Summary of a completed transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct TransferReport {
    /// Image length in bytes.
    pub total_size: u64,
    /// Chunk count announced in the header.
    pub chunk_count: u16,
    /// Packets written.
    pub packets_sent: u32,
    /// Time from header to final ACK.
    pub elapsed: Duration,
}

/// Flashes firmware images over an IAP bootloader link.
pub struct IapFlasher<P: Port> {
    port: P,
    config: SessionConfig,
    interrupted: fn() -> bool,
}

impl<P: Port> IapFlasher<P> {
    /// Create a flasher with the default session configuration.
    pub fn new(port: P) -> Self {
        Self::with_config(port, SessionConfig::default())
    }

    /// Create a flasher with a custom session configuration.
    pub fn with_config(port: P, config: SessionConfig) -> Self {
        Self {
            port,
            config,
            interrupted: is_interrupted_requested,
        }
    }

    /// Replace the global interrupt checker for this flasher.
    #[must_use]
    pub fn with_interrupt_checker(mut self, interrupted: fn() -> bool) -> Self {
        self.interrupted = interrupted;
        self
    }

    /// Session configuration used by [`flash`](Self::flash).
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Name of the underlying port.
    pub fn port_name(&self) -> &str {
        self.port.name()
    }

    /// Transfer `image` to the target.
    ///
    /// The port is closed when the transfer ends, successfully or not.
    pub fn flash<R, S>(&mut self, image: FirmwareImage<R>, sink: S) -> Result<TransferReport>
    where
        R: Read + Seek,
        S: ProgressSink,
    {
        info!(
            "Flashing {} bytes via {} at {} baud",
            image.total_length(),
            self.port.name(),
            self.port.baud_rate()
        );
        if let Err(e) = self.port.clear_buffers() {
            debug!("Could not clear port buffers: {e}");
        }

        let mut session = TransferSession::new(self.config.clone(), sink)?;
        let started = Instant::now();
        session.start(&mut self.port, image)?;

        loop {
            if (self.interrupted)() {
                warn!("Transfer interrupted");
                session.abort(Error::Cancelled);
            }

            match session.poll() {
                SessionState::Completed => break,
                SessionState::Failed => {
                    return Err(session.take_failure().unwrap_or_else(|| {
                        Error::Transport(io::Error::other("transfer failed"))
                    }));
                },
                SessionState::Idle | SessionState::AwaitingAck | SessionState::Sending => {},
            }
        }

        let chunk_count = session.header().map_or(0, |h| h.chunk_count);
        let report = TransferReport {
            total_size: session.total_size(),
            chunk_count,
            packets_sent: session.packets_sent(),
            elapsed: started.elapsed(),
        };
        info!(
            "Flashed {} bytes in {} packets ({:.2}s)",
            report.total_size,
            report.packets_sent,
            report.elapsed.as_secs_f64()
        );
        Ok(report)
    }
}
