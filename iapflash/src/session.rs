//! IAP transfer session.
//!
//! A session streams one firmware image over one port. After the header is
//! written, every ACK from the target pulls the next chunk from the image;
//! the ACK that arrives once the whole image is on the wire completes the
//! transfer. A NAK fails it at any point.
//!
//! ```text
//!            start()             ACK (bytes left)
//!   Idle ------------> AwaitingAck ----------------> Sending --+
//!                           |                         ^  |     | ACK (bytes left)
//!                           |                         |  +-----+
//!                           | NAK / timeout / error   |
//!                           v                         | ACK (nothing left)
//!                         Failed <--------------------+------------> Completed
//! ```
//!
//! The session never blocks on its own: [`TransferSession::poll`] reads what
//! the port has buffered, bounded by the port read timeout, and feeds it one
//! byte at a time to [`TransferSession::on_control_byte`].

use {
    crate::{
        error::{Error, Result},
        image::firmware::FirmwareImage,
        port::Port,
        protocol::iap::{
            self, ControlByte, DataPacket, HEADER_ACK_TIMEOUT, MAX_PACKET_SIZE, TRANSFER_TIMEOUT,
            TransferHeader,
        },
    },
    log::{debug, info, trace, warn},
    std::{
        collections::VecDeque,
        fmt,
        io::{self, Read, Seek},
        time::{Duration, Instant},
    },
};

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Not started.
    #[default]
    Idle,
    /// Header written, waiting for the first ACK.
    AwaitingAck,
    /// At least one packet written.
    Sending,
    /// The target acknowledged the whole image.
    Completed,
    /// The transfer ended with an error.
    Failed,
}

impl SessionState {
    /// Whether the session has ended.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether a transfer is in flight.
    pub fn is_active(self) -> bool {
        matches!(self, Self::AwaitingAck | Self::Sending)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::AwaitingAck => "awaiting-ack",
            Self::Sending => "sending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        })
    }
}

/// What to do with a byte that is neither ACK nor NAK during a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownBytePolicy {
    /// Fail the session with a protocol violation.
    #[default]
    Abort,
    /// Log the byte and keep waiting.
    Ignore,
}

/// Session tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Data bytes per packet, `1..=MAX_PACKET_SIZE`.
    pub max_chunk_size: usize,
    /// Deadline for the first ACK after the header, while the target
    /// erases flash. `None` waits forever.
    pub header_timeout: Option<Duration>,
    /// Deadline for the target to answer a data packet. `None` waits forever.
    pub ack_timeout: Option<Duration>,
    /// Handling of unexpected control bytes.
    pub unknown_byte_policy: UnknownBytePolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: MAX_PACKET_SIZE,
            header_timeout: Some(HEADER_ACK_TIMEOUT),
            ack_timeout: Some(TRANSFER_TIMEOUT),
            unknown_byte_policy: UnknownBytePolicy::Abort,
        }
    }
}

impl SessionConfig {
    /// Set the chunk size.
    #[must_use]
    pub fn with_max_chunk_size(mut self, size: usize) -> Self {
        self.max_chunk_size = size;
        self
    }

    /// Set the deadline for the header ACK.
    #[must_use]
    pub fn with_header_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.header_timeout = timeout;
        self
    }

    /// Set the deadline for packet ACKs.
    #[must_use]
    pub fn with_ack_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Set the unknown byte policy.
    #[must_use]
    pub fn with_unknown_byte_policy(mut self, policy: UnknownBytePolicy) -> Self {
        self.unknown_byte_policy = policy;
        self
    }

    /// Check the configuration.
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_PACKET_SIZE).contains(&self.max_chunk_size) {
            return Err(Error::Config(format!(
                "chunk size must be between 1 and {MAX_PACKET_SIZE}, got {}",
                self.max_chunk_size
            )));
        }
        if self.ack_timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::Config("ACK timeout must be non-zero".into()));
        }
        if self.header_timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::Config("header ACK timeout must be non-zero".into()));
        }
        Ok(())
    }
}

/// Receives transfer notifications.
pub trait ProgressSink {
    /// Called after each packet is written.
    fn on_progress(&mut self, bytes_sent: u64, total: u64) {
        let _ = (bytes_sent, total);
    }

    /// Called once when the target acknowledges the whole image.
    fn on_completed(&mut self) {}

    /// Called once when the transfer fails after it started.
    fn on_failed(&mut self, error: &Error) {
        let _ = error;
    }
}

impl<S: ProgressSink + ?Sized> ProgressSink for &mut S {
    fn on_progress(&mut self, bytes_sent: u64, total: u64) {
        (**self).on_progress(bytes_sent, total);
    }

    fn on_completed(&mut self) {
        (**self).on_completed();
    }

    fn on_failed(&mut self, error: &Error) {
        (**self).on_failed(error);
    }
}

/// Sink that ignores every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl ProgressSink for NoopSink {}

fn into_transport(err: Error) -> Error {
    match err {
        Error::Io(e) => Error::Transport(e),
        other => other,
    }
}

/// One attempt to transfer one image over one port.
pub struct TransferSession<P, R, S = NoopSink> {
    config: SessionConfig,
    state: SessionState,
    transport: Option<P>,
    source: Option<FirmwareImage<R>>,
    sink: S,
    header: Option<TransferHeader>,
    total_size: u64,
    bytes_sent: u64,
    sequence: u32,
    packets_sent: u32,
    inbound: VecDeque<u8>,
    last_frame_at: Option<Instant>,
    failure: Option<Error>,
}

impl<P: Port, R: Read + Seek, S: ProgressSink> TransferSession<P, R, S> {
    /// Create an idle session.
    pub fn new(config: SessionConfig, sink: S) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            state: SessionState::Idle,
            transport: None,
            source: None,
            sink,
            header: None,
            total_size: 0,
            bytes_sent: 0,
            sequence: 0,
            packets_sent: 0,
            inbound: VecDeque::new(),
            last_frame_at: None,
            failure: None,
        })
    }

    /// Take ownership of the port and image and write the transfer header.
    ///
    /// On error both resources are released and the session is `Failed`.
    pub fn start(&mut self, mut transport: P, mut source: FirmwareImage<R>) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(Error::AlreadyStarted);
        }

        let total_len = source.total_length();
        let header = match Self::send_header(&mut transport, total_len, self.config.max_chunk_size)
        {
            Ok(header) => header,
            Err(e) => {
                warn!("Failed to start transfer on {}: {e}", transport.name());
                Self::close_transport(&mut transport);
                source.close();
                self.state = SessionState::Failed;
                return Err(e);
            },
        };

        info!(
            "Header sent on {}: {} bytes, {} chunks of {} bytes",
            transport.name(),
            header.total_size,
            header.chunk_count,
            self.config.max_chunk_size
        );

        self.header = Some(header);
        self.total_size = u64::from(header.total_size);
        self.bytes_sent = 0;
        self.sequence = 0;
        self.packets_sent = 0;
        self.transport = Some(transport);
        self.source = Some(source);
        self.last_frame_at = Some(Instant::now());
        self.state = SessionState::AwaitingAck;
        Ok(())
    }

    fn send_header(transport: &mut P, total_len: u64, max_chunk: usize) -> Result<TransferHeader> {
        if total_len == 0 {
            return Err(Error::EmptyImage);
        }
        let header = TransferHeader::for_image(total_len, max_chunk)?;
        transport
            .write_frame(&iap::frame(&header.encode()))
            .map_err(into_transport)?;
        Ok(header)
    }

    /// Feed one byte received from the target.
    pub fn on_control_byte(&mut self, byte: u8) -> SessionState {
        if !self.state.is_active() {
            let violation = Error::ProtocolViolation {
                state: self.state.to_string(),
                byte,
            };
            warn!("{violation}, ignored");
            return self.state;
        }

        match ControlByte::from_byte(byte) {
            Some(ControlByte::Ack) => {
                debug!("Received {}", ControlByte::Ack);
                self.on_ack();
            },
            Some(ControlByte::Nak) => {
                warn!(
                    "Target sent NAK after {}/{} bytes",
                    self.bytes_sent, self.total_size
                );
                self.fail(Error::TargetRejected);
            },
            _ => {
                let violation = Error::ProtocolViolation {
                    state: self.state.to_string(),
                    byte,
                };
                match self.config.unknown_byte_policy {
                    UnknownBytePolicy::Abort => self.fail(violation),
                    UnknownBytePolicy::Ignore => warn!("{violation}, ignored"),
                }
            },
        }
        self.state
    }

    fn on_ack(&mut self) {
        if self.bytes_sent >= self.total_size {
            info!(
                "Transfer complete: {} bytes in {} packets",
                self.bytes_sent, self.packets_sent
            );
            self.release();
            self.state = SessionState::Completed;
            self.sink.on_completed();
            return;
        }

        if let Err(e) = self.send_next_packet() {
            self.fail(e);
        }
    }

    fn send_next_packet(&mut self) -> Result<()> {
        let source = self.source.as_mut().ok_or_else(|| {
            Error::ImageSource(io::Error::new(
                io::ErrorKind::NotConnected,
                "firmware image released",
            ))
        })?;
        let data = source
            .next_chunk(self.config.max_chunk_size)?
            .ok_or_else(|| {
                Error::ImageSource(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "image ended before its announced length",
                ))
            })?;

        let sequence = self.sequence + 1;
        let packet = DataPacket::new(sequence, data);
        let transport = self.transport.as_mut().ok_or_else(|| {
            Error::Transport(io::Error::new(io::ErrorKind::NotConnected, "port released"))
        })?;
        transport
            .write_frame(&iap::frame(&packet.encode()))
            .map_err(into_transport)?;

        self.sequence = sequence;
        self.packets_sent += 1;
        self.bytes_sent += packet.data.len() as u64;
        self.last_frame_at = Some(Instant::now());
        self.state = SessionState::Sending;

        debug!(
            "Sent packet {sequence}: {} bytes, CRC {:#010x} ({}/{})",
            packet.data.len(),
            packet.checksum,
            self.bytes_sent,
            self.total_size
        );
        self.sink.on_progress(self.bytes_sent, self.total_size);
        Ok(())
    }

    /// Read pending bytes from the port and process them in order.
    ///
    /// Bytes left over once the session ends are discarded.
    pub fn poll(&mut self) -> SessionState {
        if !self.state.is_active() {
            return self.state;
        }

        if let Err(e) = self.read_inbound() {
            self.fail(e);
            return self.state;
        }

        while let Some(byte) = self.inbound.pop_front() {
            trace!("Inbound byte 0x{byte:02X}");
            self.on_control_byte(byte);
            if self.state.is_terminal() {
                if !self.inbound.is_empty() {
                    debug!(
                        "Discarding {} bytes received after the session {}",
                        self.inbound.len(),
                        self.state
                    );
                    self.inbound.clear();
                }
                return self.state;
            }
        }

        self.check_deadline(Instant::now())
    }

    fn read_inbound(&mut self) -> Result<()> {
        let transport = self.transport.as_mut().ok_or_else(|| {
            Error::Transport(io::Error::new(io::ErrorKind::NotConnected, "port released"))
        })?;

        let mut buf = [0u8; 64];
        loop {
            let n = transport.read_available(&mut buf).map_err(into_transport)?;
            self.inbound.extend(&buf[..n]);
            if n < buf.len() {
                return Ok(());
            }
        }
    }

    /// Fail the session if the target has not answered the last frame in time.
    ///
    /// The header is answered once the target is ready to program, so it gets
    /// [`SessionConfig::header_timeout`]; packets get
    /// [`SessionConfig::ack_timeout`].
    pub fn check_deadline(&mut self, now: Instant) -> SessionState {
        let timeout = match self.state {
            SessionState::AwaitingAck => self.config.header_timeout,
            _ => self.config.ack_timeout,
        };
        let (Some(timeout), Some(sent_at)) = (timeout, self.last_frame_at) else {
            return self.state;
        };
        if self.state.is_active() && now.saturating_duration_since(sent_at) > timeout {
            let reason = format!(
                "no response within {} ms while {}",
                timeout.as_millis(),
                self.state
            );
            self.fail(Error::Timeout(reason));
        }
        self.state
    }

    /// Stop the session from outside, e.g. on Ctrl-C.
    pub fn abort(&mut self, reason: Error) {
        if self.state.is_terminal() {
            debug!("Abort ignored, session already {}", self.state);
            return;
        }
        self.fail(reason);
    }

    fn fail(&mut self, error: Error) {
        warn!("Transfer failed: {error}");
        self.release();
        self.state = SessionState::Failed;
        self.sink.on_failed(&error);
        self.failure = Some(error);
    }

    fn release(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            Self::close_transport(&mut transport);
        }
        if let Some(mut source) = self.source.take() {
            source.close();
        }
        self.last_frame_at = None;
    }

    fn close_transport(transport: &mut P) {
        if let Err(e) = transport.close() {
            debug!("Closing {} failed: {e}", transport.name());
        }
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Data bytes written so far.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Image length announced in the header.
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Sequence number of the last packet written, 0 before the first.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Packets written so far.
    pub fn packets_sent(&self) -> u32 {
        self.packets_sent
    }

    /// Header written at start.
    pub fn header(&self) -> Option<TransferHeader> {
        self.header
    }

    /// Session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Why the session failed.
    pub fn failure(&self) -> Option<&Error> {
        self.failure.as_ref()
    }

    /// Take the failure out of the session.
    pub fn take_failure(&mut self) -> Option<Error> {
        self.failure.take()
    }

    /// The progress sink.
    pub fn sink(&self) -> &S {
        &self.sink
    }
}

impl<P, R, S> fmt::Debug for TransferSession<P, R, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferSession")
            .field("state", &self.state)
            .field("bytes_sent", &self.bytes_sent)
            .field("total_size", &self.total_size)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::MockPort;
    use crate::protocol::crc::crc32;
    use crate::protocol::iap::{control, decode_header, decode_packet};
    use std::io::Cursor;

    #[derive(Default)]
    struct RecordingSink {
        progress: Vec<(u64, u64)>,
        completed: usize,
        failed: Vec<String>,
    }

    impl ProgressSink for RecordingSink {
        fn on_progress(&mut self, bytes_sent: u64, total: u64) {
            self.progress.push((bytes_sent, total));
        }

        fn on_completed(&mut self) {
            self.completed += 1;
        }

        fn on_failed(&mut self, error: &Error) {
            self.failed.push(error.to_string());
        }
    }

    type TestSession = TransferSession<MockPort, Cursor<Vec<u8>>, RecordingSink>;

    fn image_data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 13 % 251) as u8).collect()
    }

    fn start_session(data: &[u8], config: SessionConfig) -> (TestSession, MockPort) {
        let port = MockPort::new();
        let image = FirmwareImage::from_reader(Cursor::new(data.to_vec())).unwrap();
        let mut session = TestSession::new(config, RecordingSink::default()).unwrap();
        session.start(port.clone(), image).unwrap();
        (session, port)
    }

    fn no_deadline() -> SessionConfig {
        SessionConfig::default()
            .with_header_timeout(None)
            .with_ack_timeout(None)
    }

    /// Verify every packet frame and reassemble the payload.
    fn reassemble(frames: &[Vec<u8>], chunk: usize, total: usize) -> Vec<u8> {
        let mut out = Vec::new();
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame[0], control::SOH);
            let expected_len = chunk.min(total - out.len());
            let packet = decode_packet(&frame[1..], expected_len).unwrap();
            assert_eq!(packet.sequence, i as u32 + 1);
            assert_eq!(packet.checksum, crc32(&packet.data));
            out.extend_from_slice(&packet.data);
        }
        out
    }

    #[test]
    fn test_image_with_partial_last_chunk() {
        let data = image_data(2500);
        let (mut session, port) = start_session(&data, no_deadline());

        let frames = port.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], [0xAF, 0xC4, 0x09, 0x00, 0x00, 0x02, 0x00]);
        assert_eq!(session.state(), SessionState::AwaitingAck);

        assert_eq!(session.on_control_byte(control::ACK), SessionState::Sending);
        assert_eq!(session.on_control_byte(control::ACK), SessionState::Sending);
        assert_eq!(session.on_control_byte(control::ACK), SessionState::Sending);
        assert_eq!(session.bytes_sent(), 2500);
        assert_eq!(session.sequence(), 3);

        let frames = port.frames();
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[1].len(), 1 + 8 + 1024);
        assert_eq!(frames[2].len(), 1 + 8 + 1024);
        assert_eq!(frames[3].len(), 1 + 8 + 452);
        assert_eq!(reassemble(&frames[1..], 1024, 2500), data);

        assert_eq!(session.on_control_byte(control::ACK), SessionState::Completed);
        assert_eq!(port.frames().len(), 4);
        assert!(port.is_closed());
        assert_eq!(
            session.sink().progress,
            vec![(1024, 2500), (2048, 2500), (2500, 2500)]
        );
        assert_eq!(session.sink().completed, 1);
        assert!(session.sink().failed.is_empty());
    }

    #[test]
    fn test_image_of_one_full_chunk() {
        let data = image_data(1024);
        let (mut session, port) = start_session(&data, no_deadline());

        let header = decode_header(&port.frames()[0][1..]).unwrap();
        assert_eq!(header, TransferHeader::new(1024, 1));

        session.on_control_byte(control::ACK);
        assert_eq!(session.packets_sent(), 1);
        assert_eq!(session.bytes_sent(), 1024);

        session.on_control_byte(control::ACK);
        assert_eq!(session.state(), SessionState::Completed);
        assert_eq!(port.frames().len(), 2);
        assert_eq!(reassemble(&port.frames()[1..], 1024, 1024), data);
    }

    #[test]
    fn test_exact_multiples_send_full_packets() {
        for k in 1..=4usize {
            let chunk = 256;
            let data = image_data(k * chunk);
            let config = no_deadline().with_max_chunk_size(chunk);
            let (mut session, port) = start_session(&data, config);

            assert_eq!(session.header().unwrap().chunk_count as usize, k);
            while session.on_control_byte(control::ACK) != SessionState::Completed {}

            let frames = port.frames();
            assert_eq!(frames.len(), 1 + k);
            assert!(frames[1..].iter().all(|f| f.len() == 1 + 8 + chunk));
            assert_eq!(session.packets_sent() as usize, k);
        }
    }

    #[test]
    fn test_remainder_goes_in_last_packet() {
        for (len, chunk, last) in [
            (1usize, 1024usize, 1usize),
            (1025, 1024, 1),
            (700, 256, 188),
            (3, 2, 1),
        ] {
            let data = image_data(len);
            let config = no_deadline().with_max_chunk_size(chunk);
            let (mut session, port) = start_session(&data, config);

            assert_eq!(session.header().unwrap().chunk_count as usize, len / chunk);
            while session.on_control_byte(control::ACK) != SessionState::Completed {}

            let frames = port.frames();
            assert_eq!(frames.len(), 1 + len.div_ceil(chunk));
            assert_eq!(frames.last().unwrap().len(), 1 + 8 + last);
            assert_eq!(reassemble(&frames[1..], chunk, len), data);
            assert_eq!(session.bytes_sent(), len as u64);
        }
    }

    #[test]
    fn test_nak_before_first_ack() {
        let (mut session, port) = start_session(&image_data(2500), no_deadline());

        assert_eq!(session.on_control_byte(control::NAK), SessionState::Failed);
        assert!(matches!(session.failure(), Some(Error::TargetRejected)));
        assert_eq!(port.frames().len(), 1);
        assert_eq!(session.bytes_sent(), 0);
        assert!(port.is_closed());
        assert_eq!(session.sink().failed.len(), 1);
        assert_eq!(session.sink().completed, 0);
    }

    #[test]
    fn test_nak_mid_transfer() {
        let (mut session, port) = start_session(&image_data(2500), no_deadline());

        session.on_control_byte(control::ACK);
        assert_eq!(session.on_control_byte(control::NAK), SessionState::Failed);
        assert_eq!(session.bytes_sent(), 1024);
        assert_eq!(port.frames().len(), 2);
        assert!(matches!(session.take_failure(), Some(Error::TargetRejected)));
        assert!(session.failure().is_none());
    }

    #[test]
    fn test_nak_after_last_packet() {
        let (mut session, port) = start_session(&image_data(2500), no_deadline());

        for _ in 0..3 {
            session.on_control_byte(control::ACK);
        }
        assert_eq!(session.bytes_sent(), 2500);
        assert!(!port.is_closed());
        assert_eq!(session.on_control_byte(control::NAK), SessionState::Failed);
        assert_eq!(session.sink().completed, 0);
        assert_eq!(session.sink().failed.len(), 1);
        assert!(matches!(session.failure(), Some(Error::TargetRejected)));
        assert!(port.is_closed());

        // Late bytes do not fail the session a second time.
        session.on_control_byte(control::NAK);
        assert_eq!(session.sink().failed.len(), 1);
    }

    #[test]
    fn test_ack_after_completed_is_ignored() {
        let (mut session, port) = start_session(&image_data(10), no_deadline());

        session.on_control_byte(control::ACK);
        session.on_control_byte(control::ACK);
        assert_eq!(session.state(), SessionState::Completed);

        assert_eq!(session.on_control_byte(control::ACK), SessionState::Completed);
        assert_eq!(session.on_control_byte(control::NAK), SessionState::Completed);
        assert_eq!(port.frames().len(), 2);
        assert_eq!(session.sink().completed, 1);
        assert!(session.failure().is_none());
    }

    #[test]
    fn test_control_byte_while_idle_is_ignored() {
        let mut session = TestSession::new(no_deadline(), RecordingSink::default()).unwrap();
        assert_eq!(session.on_control_byte(control::ACK), SessionState::Idle);
        assert_eq!(session.on_control_byte(control::NAK), SessionState::Idle);
    }

    #[test]
    fn test_unknown_byte_aborts_by_default() {
        let (mut session, port) = start_session(&image_data(100), no_deadline());

        assert_eq!(session.on_control_byte(0x06), SessionState::Failed);
        assert!(matches!(
            session.failure(),
            Some(Error::ProtocolViolation { byte: 0x06, .. })
        ));
        assert!(port.is_closed());
    }

    #[test]
    fn test_unknown_byte_ignored_when_lenient() {
        let config = no_deadline().with_unknown_byte_policy(UnknownBytePolicy::Ignore);
        let (mut session, _port) = start_session(&image_data(100), config);

        assert_eq!(
            session.on_control_byte(control::QRY),
            SessionState::AwaitingAck
        );
        assert_eq!(session.on_control_byte(0x00), SessionState::AwaitingAck);
        assert_eq!(session.on_control_byte(control::ACK), SessionState::Sending);
        assert_eq!(session.on_control_byte(control::ACK), SessionState::Completed);
    }

    #[test]
    fn test_start_twice() {
        let (mut session, _port) = start_session(&image_data(100), no_deadline());
        let image = FirmwareImage::from_reader(Cursor::new(image_data(10))).unwrap();

        let err = session.start(MockPort::new(), image).unwrap_err();
        assert!(matches!(err, Error::AlreadyStarted));
        assert_eq!(session.state(), SessionState::AwaitingAck);
    }

    #[test]
    fn test_start_empty_image() {
        let port = MockPort::new();
        let image = FirmwareImage::from_reader(Cursor::new(Vec::new())).unwrap();
        let mut session = TestSession::new(no_deadline(), RecordingSink::default()).unwrap();

        let err = session.start(port.clone(), image).unwrap_err();
        assert!(matches!(err, Error::EmptyImage));
        assert_eq!(session.state(), SessionState::Failed);
        assert!(port.frames().is_empty());
        assert!(port.is_closed());
    }

    #[test]
    fn test_start_write_failure() {
        let port = MockPort::new();
        port.set_fail_writes(true);
        let image = FirmwareImage::from_reader(Cursor::new(image_data(100))).unwrap();
        let mut session = TestSession::new(no_deadline(), RecordingSink::default()).unwrap();

        let err = session.start(port.clone(), image).unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[test]
    fn test_write_failure_mid_transfer() {
        let (mut session, port) = start_session(&image_data(2500), no_deadline());

        session.on_control_byte(control::ACK);
        port.set_fail_writes(true);
        assert_eq!(session.on_control_byte(control::ACK), SessionState::Failed);
        assert!(matches!(session.failure(), Some(Error::Transport(_))));
        assert_eq!(session.sequence(), 1);
    }

    #[test]
    fn test_deadline() {
        let config = SessionConfig::default().with_header_timeout(Some(Duration::from_secs(5)));
        let (mut session, port) = start_session(&image_data(100), config);

        assert_eq!(
            session.check_deadline(Instant::now()),
            SessionState::AwaitingAck
        );
        assert_eq!(
            session.check_deadline(Instant::now() + Duration::from_secs(6)),
            SessionState::Failed
        );
        assert!(matches!(session.failure(), Some(Error::Timeout(_))));
        assert!(port.is_closed());
    }

    #[test]
    fn test_header_ack_gets_longer_deadline() {
        let config = SessionConfig::default()
            .with_header_timeout(Some(Duration::from_secs(5)))
            .with_ack_timeout(Some(Duration::from_millis(100)));
        let (mut session, port) = start_session(&image_data(2500), config);

        // Erasing flash: well past the packet deadline, within the header one.
        assert_eq!(
            session.check_deadline(Instant::now() + Duration::from_secs(1)),
            SessionState::AwaitingAck
        );

        session.on_control_byte(control::ACK);
        assert_eq!(session.state(), SessionState::Sending);
        assert_eq!(
            session.check_deadline(Instant::now() + Duration::from_secs(1)),
            SessionState::Failed
        );
        assert!(matches!(session.failure(), Some(Error::Timeout(_))));
        assert!(port.is_closed());
    }

    #[test]
    fn test_default_deadlines() {
        let config = SessionConfig::default();
        assert_eq!(config.header_timeout, Some(HEADER_ACK_TIMEOUT));
        assert_eq!(config.ack_timeout, Some(TRANSFER_TIMEOUT));
        assert!(HEADER_ACK_TIMEOUT > TRANSFER_TIMEOUT);
    }

    #[test]
    fn test_deadline_disabled() {
        let (mut session, _port) = start_session(&image_data(100), no_deadline());
        assert_eq!(
            session.check_deadline(Instant::now() + Duration::from_secs(3600)),
            SessionState::AwaitingAck
        );
    }

    #[test]
    fn test_poll_processes_queued_bytes() {
        let data = image_data(2500);
        let (mut session, port) = start_session(&data, no_deadline());

        // Four ACKs plus a stray trailing byte, all in one read.
        port.push_response(&[control::ACK; 5]);
        assert_eq!(session.poll(), SessionState::Completed);
        assert_eq!(reassemble(&port.frames()[1..], 1024, 2500), data);
        assert_eq!(session.sink().completed, 1);
        assert_eq!(session.poll(), SessionState::Completed);
    }

    #[test]
    fn test_poll_without_input_keeps_waiting() {
        let (mut session, _port) = start_session(&image_data(100), no_deadline());
        assert_eq!(session.poll(), SessionState::AwaitingAck);
        assert_eq!(session.poll(), SessionState::AwaitingAck);
    }

    #[test]
    fn test_poll_closed_transport_fails() {
        let (mut session, port) = start_session(&image_data(100), no_deadline());

        port.set_closed(true);
        assert_eq!(session.poll(), SessionState::Failed);
        assert!(matches!(session.failure(), Some(Error::Transport(_))));
        assert_eq!(session.sink().failed.len(), 1);
    }

    #[test]
    fn test_abort() {
        let (mut session, port) = start_session(&image_data(100), no_deadline());

        session.abort(Error::Cancelled);
        assert_eq!(session.state(), SessionState::Failed);
        assert!(matches!(session.failure(), Some(Error::Cancelled)));
        assert!(port.is_closed());

        // A second abort keeps the first reason.
        session.abort(Error::TargetRejected);
        assert!(matches!(session.failure(), Some(Error::Cancelled)));
        assert_eq!(session.sink().failed.len(), 1);
    }

    #[test]
    fn test_config_validation() {
        assert!(SessionConfig::default().validate().is_ok());
        assert!(
            SessionConfig::default()
                .with_max_chunk_size(0)
                .validate()
                .is_err()
        );
        assert!(
            SessionConfig::default()
                .with_max_chunk_size(MAX_PACKET_SIZE + 1)
                .validate()
                .is_err()
        );
        assert!(
            SessionConfig::default()
                .with_ack_timeout(Some(Duration::ZERO))
                .validate()
                .is_err()
        );
        assert!(
            SessionConfig::default()
                .with_header_timeout(Some(Duration::ZERO))
                .validate()
                .is_err()
        );

        let config = SessionConfig::default().with_max_chunk_size(0);
        assert!(matches!(
            TestSession::new(config, RecordingSink::default()),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::AwaitingAck.to_string(), "awaiting-ack");
        assert!(SessionState::Completed.is_terminal());
        assert!(SessionState::Sending.is_active());
        assert!(!SessionState::Idle.is_active());
    }
}
