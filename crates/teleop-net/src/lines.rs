use crate::ConnectionError;
use std::io::{ErrorKind, Read};
use tracing::warn;

/// Longest line kept; anything longer is dropped through its newline.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

const CHUNK: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadEvent {
    Line(String),
    /// The bounded read wait elapsed with no complete line.
    Idle,
}

/// Newline framer over a byte stream.
pub struct LineReader<R> {
    inner: R,
    buf: Vec<u8>,
    discarding: bool,
    max_line: usize,
    finished: bool,
}

impl<R: Read> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_max_line(inner, MAX_LINE_BYTES)
    }

    pub fn with_max_line(inner: R, max_line: usize) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(CHUNK),
            discarding: false,
            max_line,
            finished: false,
        }
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Next complete line, or `Idle` when a read timed out. A zero-byte
    /// read means the peer is gone.
    pub fn next_event(&mut self) -> Result<ReadEvent, ConnectionError> {
        let mut chunk = [0u8; CHUNK];
        loop {
            if let Some(line) = self.take_line() {
                return Ok(ReadEvent::Line(line));
            }
            match self.inner.read(&mut chunk) {
                Ok(0) => return Err(ConnectionError::Disconnected),
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Ok(ReadEvent::Idle);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(ConnectionError::Io(e)),
            }
        }
    }

    fn take_line(&mut self) -> Option<String> {
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            if self.discarding {
                self.discarding = false;
                continue;
            }
            if pos > self.max_line {
                warn!(bytes = pos, "discarding oversized line");
                continue;
            }
            let text = String::from_utf8_lossy(&raw[..pos]);
            let line = text.trim();
            if !line.is_empty() {
                return Some(line.to_string());
            }
        }
        if self.buf.len() > self.max_line {
            warn!(bytes = self.buf.len(), "discarding oversized line");
            self.buf.clear();
            self.discarding = true;
        }
        None
    }
}

/// Lines until the connection ends; idle waits are retried silently. The
/// error that ended the sequence is yielded last.
impl<R: Read> Iterator for LineReader<R> {
    type Item = Result<String, ConnectionError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            match self.next_event() {
                Ok(ReadEvent::Line(line)) => return Some(Ok(line)),
                Ok(ReadEvent::Idle) => continue,
                Err(err) => {
                    self.finished = true;
                    return Some(Err(err));
                }
            }
        }
    }
}
