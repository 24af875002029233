//! ETB-delimited frame assembly.
//!
//! The assembler is fed whatever chunk the serial driver delivered and yields
//! the messages completed by that chunk. Chunks may split a frame anywhere; the
//! partial frame is carried over to the next call.
//!
//! ```
//! use divider_controller::protocol::FrameAssembler;
//!
//! let mut assembler = FrameAssembler::new(64);
//! assert_eq!(assembler.feed(b"A12.").count(), 0);
//! let frames: Vec<String> = assembler.feed(b"50\r\n\x17S0\x17").collect();
//! assert_eq!(frames, vec!["A12.50".to_string(), "S0".to_string()]);
//! ```

use super::{CR, EOT, ETB, LF};
use bytes::BytesMut;

/// Accumulates raw bytes and splits them into messages on [`ETB`].
#[derive(Debug)]
pub struct FrameAssembler {
    buffer: BytesMut,
    capacity: usize,
    /// Set after an overrun until the next delimiter resynchronizes the stream.
    discarding: bool,
    overruns: u64,
}

impl FrameAssembler {
    /// Create an assembler that holds at most `capacity` raw bytes per frame.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buffer: BytesMut::with_capacity(capacity),
            capacity,
            discarding: false,
            overruns: 0,
        }
    }

    /// Feed newly arrived bytes.
    ///
    /// The returned iterator is lazy: bytes are consumed as messages are pulled.
    /// Dropping it early leaves the unconsumed bytes unprocessed, so callers
    /// should drain it.
    pub fn feed<'a>(&'a mut self, data: &'a [u8]) -> Frames<'a> {
        Frames {
            assembler: self,
            data,
            pos: 0,
        }
    }

    /// Number of frames dropped because they outgrew the buffer.
    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    /// Raw bytes currently waiting for a delimiter.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    fn push(&mut self, byte: u8) -> Option<String> {
        if byte == ETB {
            if self.discarding {
                self.discarding = false;
                return None;
            }
            if self.buffer.is_empty() {
                return None;
            }
            let frame = self.buffer.split();
            return Some(decode(&frame));
        }

        if self.discarding {
            return None;
        }

        if self.buffer.len() >= self.capacity {
            self.overruns += 1;
            tracing::warn!(
                capacity = self.capacity,
                overruns = self.overruns,
                "Frame buffer overrun without delimiter, dropping partial frame"
            );
            self.buffer.clear();
            self.discarding = true;
            return None;
        }

        self.buffer.extend_from_slice(&[byte]);
        None
    }
}

/// Strip control bytes and widen each remaining byte to a char.
fn decode(raw: &[u8]) -> String {
    raw.iter()
        .filter(|b| !matches!(**b, EOT | CR | LF))
        .map(|&b| char::from(b))
        .collect()
}

/// Messages completed by one [`FrameAssembler::feed`] call.
#[derive(Debug)]
pub struct Frames<'a> {
    assembler: &'a mut FrameAssembler,
    data: &'a [u8],
    pos: usize,
}

impl Iterator for Frames<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        while let Some(&byte) = self.data.get(self.pos) {
            self.pos += 1;
            if let Some(message) = self.assembler.push(byte) {
                return Some(message);
            }
        }
        None
    }
}
