//! Fragment-tolerant frame reader.
//!
//! Providers write newline-delimited messages, but a pipe read can return half
//! a message, several messages, or a message pretty-printed across several
//! lines. [`FrameReader`] turns such a byte stream into complete frames.
//!
//! A raw control character inside a JSON string is invalid JSON, so a string
//! value broken by a literal newline is reported as undecodable rather than
//! reassembled.
//!
//! # Memory Model
//!
//! A reader holds exactly two buffers:
//!
//! - a fixed-size read buffer, allocated once and reused for every read
//! - a [`FrameBuffer`] for the frame currently being assembled, which never
//!   grows past its ceiling and is cleared (not reallocated) after each frame
//!
//! Peak memory is therefore `read_buffer_size + frame_ceiling` no matter how
//! much output the provider produces.
//!
//! # Decoding Rules (JSON framing)
//!
//! On each delimiter the accumulated text is decoded:
//!
//! - success: the frame is emitted and the buffer cleared
//! - the parser ran out of input: the newline was part of the payload, so it
//!   is kept and accumulation continues
//! - any other parse error: the text is reported as undecodable and dropped
//!
//! A frame that would exceed the ceiling is reported once as
//! [`ReaderItem::Oversized`]; the rest of it, up to the next delimiter, is
//! skipped so the following frame parses normally.

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;
pub const DEFAULT_FRAME_CEILING: usize = 1024 * 1024;

const DELIMITER: u8 = b'\n';

/// How bytes between delimiters are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Each frame is one JSON value (possibly spanning several lines).
    Json,
    /// Each frame is one line of text.
    Lines,
}

/// One item produced by a [`FrameReader`].
#[derive(Debug, Clone, PartialEq)]
pub enum ReaderItem {
    Frame(Value),
    Line(String),
    /// Text that is not a JSON frame (e.g. a stray log line on stdout).
    Undecodable(String),
    /// A frame exceeded the ceiling and was discarded.
    Oversized { ceiling: usize },
    /// The underlying pipe failed; the reader is finished.
    Failed(String),
}

/// The assembled frame would exceed the ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overflow;

// ============================================================================
// FrameBuffer
// ============================================================================

/// Bounded, reusable byte accumulator.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    ceiling: usize,
}

impl FrameBuffer {
    pub fn with_ceiling(ceiling: usize) -> Self {
        Self {
            buf: Vec::new(),
            ceiling,
        }
    }

    /// Append bytes, refusing anything that would pass the ceiling.
    ///
    /// On [`Overflow`] the buffer is left unchanged.
    pub fn push(&mut self, bytes: &[u8]) -> Result<(), Overflow> {
        let needed = self.buf.len() + bytes.len();
        if needed > self.ceiling {
            return Err(Overflow);
        }
        if needed > self.buf.capacity() {
            let target = needed.max((self.buf.capacity() * 2).min(self.ceiling));
            self.buf.reserve_exact(target - self.buf.len());
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Forget the contents, keeping the allocation.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }
}

// ============================================================================
// FrameReader
// ============================================================================

/// Reads complete frames from an async byte source.
pub struct FrameReader<R> {
    inner: R,
    read_buf: Box<[u8]>,
    start: usize,
    end: usize,
    frame: FrameBuffer,
    framing: Framing,
    /// Skipping the tail of an oversized frame.
    discarding: bool,
    eof: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, framing: Framing) -> Self {
        Self::with_limits(inner, framing, DEFAULT_READ_BUFFER_SIZE, DEFAULT_FRAME_CEILING)
    }

    pub fn with_limits(
        inner: R,
        framing: Framing,
        read_buffer_size: usize,
        frame_ceiling: usize,
    ) -> Self {
        Self {
            inner,
            read_buf: vec![0u8; read_buffer_size.max(1)].into_boxed_slice(),
            start: 0,
            end: 0,
            frame: FrameBuffer::with_ceiling(frame_ceiling),
            framing,
            discarding: false,
            eof: false,
        }
    }

    /// Bytes currently allocated by both buffers.
    pub fn buffered_capacity(&self) -> usize {
        self.read_buf.len() + self.frame.capacity()
    }

    /// Next item, or `None` once the stream is exhausted.
    pub async fn next(&mut self) -> Option<ReaderItem> {
        loop {
            if self.start < self.end {
                if let Some(item) = self.consume_pending() {
                    return Some(item);
                }
                continue;
            }

            if self.eof {
                return self.finish();
            }

            match self.inner.read(&mut self.read_buf).await {
                Ok(0) => self.eof = true,
                Ok(n) => {
                    self.start = 0;
                    self.end = n;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log::debug!("Frame reader stopped: {}", e);
                    self.eof = true;
                    self.frame.clear();
                    self.discarding = false;
                    return Some(ReaderItem::Failed(e.to_string()));
                }
            }
        }
    }

    /// Process bytes in `read_buf[start..end]` up to the next delimiter.
    fn consume_pending(&mut self) -> Option<ReaderItem> {
        let pending = &self.read_buf[self.start..self.end];
        let delimiter = pending.iter().position(|&b| b == DELIMITER);

        if self.discarding {
            match delimiter {
                Some(i) => {
                    self.start += i + 1;
                    self.discarding = false;
                }
                None => self.start = self.end,
            }
            return None;
        }

        match delimiter {
            Some(i) => {
                let chunk_end = self.start + i;
                let pushed = self.frame.push(&self.read_buf[self.start..chunk_end]);
                self.start = chunk_end + 1;
                match pushed {
                    Ok(()) => self.complete_line(),
                    Err(Overflow) => Some(self.overflowed(false)),
                }
            }
            None => {
                let pushed = self.frame.push(&self.read_buf[self.start..self.end]);
                self.start = self.end;
                match pushed {
                    Ok(()) => None,
                    Err(Overflow) => Some(self.overflowed(true)),
                }
            }
        }
    }

    fn overflowed(&mut self, mid_frame: bool) -> ReaderItem {
        log::warn!(
            "Discarding frame larger than {} bytes",
            self.frame.ceiling()
        );
        self.frame.clear();
        self.discarding = mid_frame;
        ReaderItem::Oversized {
            ceiling: self.frame.ceiling(),
        }
    }

    /// A delimiter was reached; decide whether the frame is complete.
    fn complete_line(&mut self) -> Option<ReaderItem> {
        match self.framing {
            Framing::Lines => {
                let line = trim_line(self.frame.as_bytes());
                self.frame.clear();
                if line.is_empty() {
                    None
                } else {
                    Some(ReaderItem::Line(line))
                }
            }
            Framing::Json => match decode(self.frame.as_bytes()) {
                Decoded::Blank => {
                    self.frame.clear();
                    None
                }
                Decoded::Frame(value) => {
                    self.frame.clear();
                    Some(ReaderItem::Frame(value))
                }
                Decoded::Incomplete => {
                    if self.frame.push(&[DELIMITER]).is_err() {
                        return Some(self.overflowed(false));
                    }
                    None
                }
                Decoded::Invalid(text) => {
                    self.frame.clear();
                    Some(ReaderItem::Undecodable(text))
                }
            },
        }
    }

    /// End of stream: one last decode of whatever is left.
    fn finish(&mut self) -> Option<ReaderItem> {
        if self.frame.is_empty() {
            return None;
        }
        let item = match self.framing {
            Framing::Lines => {
                let line = trim_line(self.frame.as_bytes());
                (!line.is_empty()).then_some(ReaderItem::Line(line))
            }
            Framing::Json => match decode(self.frame.as_bytes()) {
                Decoded::Blank => None,
                Decoded::Frame(value) => Some(ReaderItem::Frame(value)),
                Decoded::Incomplete | Decoded::Invalid(_) => Some(ReaderItem::Undecodable(
                    String::from_utf8_lossy(self.frame.as_bytes()).trim().to_string(),
                )),
            },
        };
        self.frame.clear();
        item
    }
}

enum Decoded {
    Blank,
    Frame(Value),
    Incomplete,
    Invalid(String),
}

fn decode(bytes: &[u8]) -> Decoded {
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Decoded::Blank;
    }
    if !(trimmed.starts_with('{') || trimmed.starts_with('[')) {
        return Decoded::Invalid(trimmed.to_string());
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => Decoded::Frame(value),
        Err(e) if e.is_eof() => Decoded::Incomplete,
        Err(_) => Decoded::Invalid(trimmed.to_string()),
    }
}

fn trim_line(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    text.trim_end_matches('\r').to_string()
}

// ============================================================================
// TESTS
// ============================================================================
