//! Text framing for position beacons on the shared serial link.
//!
//! Every node emits its position as:
//!
//!   `S<id>;<x>;<y>[;<signal>]E`
//!
//! There is no length prefix, checksum or escaping, so node ids must never contain
//! the marker bytes or the separator. The [`FrameScanner`] can be fed arbitrary chunks
//! and yields whole frames once both markers have arrived. Bytes of a frame still
//! waiting for its end marker stay buffered until more input arrives.
use bytes::{Buf, BytesMut};
use log::warn;
use thiserror::Error;

use super::neighbors::SelfState;

pub const START: u8 = b'S';
pub const END: u8 = b'E';
pub const SEPARATOR: char = ';';

/// Default upper bound on buffered bytes awaiting an end marker
pub const DEFAULT_MAX_BUFFER: usize = 4096;

/// Reasons a complete frame was rejected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FrameError {
    #[error("expected at least 3 fields, got {0}")]
    TooFewFields(usize),

    #[error("empty sender id")]
    EmptySenderId,

    #[error("invalid {field} coordinate: {value:?}")]
    InvalidCoordinate { field: &'static str, value: String },
}

/// One decoded position beacon.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub sender_id: String,
    pub x: f64,
    pub y: f64,
    pub signal_strength: Option<f64>,
    key: String,
}

impl Frame {
    /// Parse the text found strictly between the start and end markers.
    pub fn parse_payload(payload: &str) -> Result<Self, FrameError> {
        let parts: Vec<&str> = payload.split(SEPARATOR).collect();
        if parts.len() < 3 {
            return Err(FrameError::TooFewFields(parts.len()));
        }
        let sender_id = parts[0];
        if sender_id.is_empty() {
            return Err(FrameError::EmptySenderId);
        }
        let x = parse_coordinate("x", parts[1])?;
        let y = parse_coordinate("y", parts[2])?;
        // An unreadable signal field does not invalidate the position
        let signal_strength = parts.get(3).and_then(|s| s.trim().parse::<f64>().ok());

        Ok(Frame {
            sender_id: sender_id.to_string(),
            x,
            y,
            signal_strength,
            key: format!("{}{SEPARATOR}{}{SEPARATOR}{}", parts[0], parts[1], parts[2]),
        })
    }

    /// Identity of the event carried by this frame: the raw sender, x and y text.
    /// Signal strength is deliberately left out.
    pub fn dedup_key(&self) -> &str {
        &self.key
    }
}

fn parse_coordinate(field: &'static str, raw: &str) -> Result<f64, FrameError> {
    raw.trim()
        .parse::<f64>()
        .map_err(|_| FrameError::InvalidCoordinate {
            field,
            value: raw.to_string(),
        })
}

/// Encode our own state as a wire frame.
pub fn encode(state: &SelfState) -> Vec<u8> {
    // f64 Display is the shortest round-trip form and never uses exponent notation,
    // so an 'E' cannot leak into the numeric fields.
    format!(
        "{}{}{SEPARATOR}{}{SEPARATOR}{}{}",
        START as char, state.id, state.x, state.y, END as char
    )
    .into_bytes()
}

/// Outcome of a single scan over a buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum Scan {
    /// No complete frame at or after the start position; nothing may be consumed.
    Incomplete,
    /// A complete frame was found. `consumed` counts bytes from the beginning of the
    /// buffer up to and including the end marker.
    Complete {
        frame: Result<Frame, FrameError>,
        consumed: usize,
    },
}

/// Locate the first complete frame in `buf` starting at `start`.
pub fn scan(buf: &[u8], start: usize) -> Scan {
    if start >= buf.len() {
        return Scan::Incomplete;
    }
    let Some(open) = buf[start..].iter().position(|&b| b == START).map(|i| start + i) else {
        return Scan::Incomplete;
    };
    let Some(close) = buf[open + 1..]
        .iter()
        .position(|&b| b == END)
        .map(|i| open + 1 + i)
    else {
        return Scan::Incomplete;
    };

    let frame = Frame::parse_payload(&decode_dropping_invalid(&buf[open + 1..close]));
    Scan::Complete {
        frame,
        consumed: close + 1,
    }
}

/// Decode payload bytes, dropping any that are not valid UTF-8. Line noise inside an
/// otherwise intact frame then costs the stray byte, not the frame.
fn decode_dropping_invalid(bytes: &[u8]) -> String {
    let mut text = String::with_capacity(bytes.len());
    for chunk in bytes.utf8_chunks() {
        text.push_str(chunk.valid());
    }
    text
}

/// Incremental scanner over an accumulating receive buffer.
#[derive(Debug)]
pub struct FrameScanner {
    buf: BytesMut,
    max_buffer: usize,
    overflows: u64,
}

impl Default for FrameScanner {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUFFER)
    }
}

impl FrameScanner {
    pub fn new(max_buffer: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(max_buffer.min(DEFAULT_MAX_BUFFER)),
            max_buffer: max_buffer.max(1),
            overflows: 0,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Extract the next complete frame, valid or not. Returns None once the
    /// remaining bytes hold no complete frame.
    pub fn next_frame(&mut self) -> Option<Result<Frame, FrameError>> {
        match scan(&self.buf, 0) {
            Scan::Complete { frame, consumed } => {
                self.buf.advance(consumed);
                Some(frame)
            }
            Scan::Incomplete => {
                self.enforce_bound();
                None
            }
        }
    }

    /// Bytes still waiting for a complete frame.
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }

    /// How many times the buffer bound forced a resync.
    pub fn overflows(&self) -> u64 {
        self.overflows
    }

    fn enforce_bound(&mut self) {
        if self.buf.len() <= self.max_buffer {
            return;
        }
        let before = self.buf.len();
        match self.buf.iter().rposition(|&b| b == START) {
            Some(idx) if before - idx <= self.max_buffer => self.buf.advance(idx),
            _ => self.buf.clear(),
        }
        self.overflows += 1;
        warn!(
            "Receive buffer exceeded {} bytes without a complete frame; dropped {} bytes",
            self.max_buffer,
            before - self.buf.len()
        );
    }
}
