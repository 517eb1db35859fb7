//! In-memory port for session and driver tests.

use {
    crate::{error::Result, port::Port},
    std::{
        collections::VecDeque,
        io::{self, Read, Write},
        sync::{Arc, Mutex, MutexGuard},
        time::Duration,
    },
};

#[derive(Default)]
pub(crate) struct MockState {
    pub read_buf: VecDeque<u8>,
    pub write_buf: Vec<u8>,
    pub writes: Vec<Vec<u8>>,
    pub closed: bool,
    pub fail_writes: bool,
}

/// Mock serial port with separate read/write buffers.
///
/// Clones share the same buffers, so a test can keep a handle while the
/// session owns the port.
#[derive(Clone, Default)]
pub(crate) struct MockPort {
    state: Arc<Mutex<MockState>>,
}

impl MockPort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Queue bytes for the session to read.
    pub fn push_response(&self, bytes: &[u8]) {
        self.state().read_buf.extend(bytes.iter().copied());
    }

    /// Frames written so far, one entry per `write_frame` call.
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.state().writes.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    pub fn set_closed(&self, closed: bool) {
        self.state().closed = closed;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.state().fail_writes = fail;
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "port closed")
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state();
        if state.closed {
            return Err(not_connected());
        }
        if state.read_buf.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(state.read_buf.len());
        for b in buf.iter_mut().take(n) {
            *b = state.read_buf.pop_front().unwrap();
        }
        Ok(n)
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state();
        if state.closed {
            return Err(not_connected());
        }
        if state.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "write failed"));
        }
        state.write_buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut state = self.state();
        if state.closed {
            return Err(not_connected());
        }
        let frame = std::mem::take(&mut state.write_buf);
        if !frame.is_empty() {
            state.writes.push(frame);
        }
        Ok(())
    }
}

impl Port for MockPort {
    fn name(&self) -> &str {
        "mock"
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(1)
    }

    fn set_timeout(&mut self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        115200
    }

    // Responses are queued before the transfer starts, keep them.
    fn clear_buffers(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.state().closed = true;
        Ok(())
    }
}
