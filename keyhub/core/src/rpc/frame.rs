//! Frame Protocol
//!
//! Wire format for host/module RPC messages: length-prefixed JSON with a
//! CRC32 checksum.
//!
//! ```text
//! +----------------+----------------+------------------------------------------+
//! | Length (4)     | Checksum (4)   | JSON Payload (variable)                  |
//! | big-endian u32 | CRC32          | Envelope                                 |
//! +----------------+----------------+------------------------------------------+
//! ```
//!
//! A frame whose checksum or JSON is bad is skipped as a whole: the decoder
//! still advances past it, so one malformed message never wedges the stream.
//! Only an oversized length prefix is unrecoverable.

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Maximum frame size (10 MB)
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Minimum buffer capacity for decoder
const MIN_BUFFER_CAPACITY: usize = 4096;

/// Frame header size: 4 bytes length + 4 bytes checksum
const HEADER_SIZE: usize = 8;

/// Frame-level decode/encode failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Length prefix exceeds [`MAX_FRAME_SIZE`]; the stream cannot be resynchronised
    #[error("frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    TooLarge(usize),

    /// Payload checksum does not match; the frame was skipped
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Checksum from the header
        expected: u32,
        /// Checksum of the received payload
        actual: u32,
    },

    /// Payload is not the expected JSON shape; the frame was skipped
    #[error("malformed payload: {0}")]
    Malformed(String),
}

impl FrameError {
    /// Whether the decoder can continue after this error
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::TooLarge(_))
    }
}

#[inline]
fn compute_checksum(payload: &[u8]) -> u32 {
    crc32fast::hash(payload)
}

/// Encode a message to a length-prefixed frame with CRC32 checksum
///
/// # Errors
///
/// Returns `Malformed` if serialization fails and `TooLarge` if the payload
/// exceeds [`MAX_FRAME_SIZE`].
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, FrameError> {
    let json = serde_json::to_vec(msg).map_err(|e| FrameError::Malformed(e.to_string()))?;

    if json.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(json.len()));
    }

    let len = json.len() as u32;
    let checksum = compute_checksum(&json);

    let mut buf = Vec::with_capacity(HEADER_SIZE + json.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&checksum.to_be_bytes());
    buf.extend_from_slice(&json);
    Ok(buf)
}

/// Streaming frame decoder
///
/// Buffers incoming bytes and yields complete messages.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    read_pos: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Create a new decoder with default buffer capacity
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(MIN_BUFFER_CAPACITY),
            read_pos: 0,
        }
    }

    /// Append bytes to the buffer
    pub fn push(&mut self, data: &[u8]) {
        if self.read_pos > self.buffer.len() / 2 && self.read_pos > MIN_BUFFER_CAPACITY {
            self.buffer.drain(..self.read_pos);
            self.read_pos = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    /// Bytes buffered but not yet decoded
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    /// Try to decode the next frame
    ///
    /// Returns `Ok(None)` when more data is needed.
    ///
    /// # Errors
    ///
    /// Returns a [`FrameError`]; check [`FrameError::is_recoverable`] before
    /// decoding further.
    pub fn decode<T: DeserializeOwned>(&mut self) -> Result<Option<T>, FrameError> {
        let available = self.available();
        if available < HEADER_SIZE {
            return Ok(None);
        }

        let header = &self.buffer[self.read_pos..self.read_pos + HEADER_SIZE];
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let expected = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);

        if len > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(len));
        }
        if available < HEADER_SIZE + len {
            return Ok(None);
        }

        let payload_start = self.read_pos + HEADER_SIZE;
        let payload_end = payload_start + len;
        self.read_pos = payload_end;
        let payload = &self.buffer[payload_start..payload_end];

        let actual = compute_checksum(payload);
        if actual != expected {
            return Err(FrameError::ChecksumMismatch { expected, actual });
        }

        serde_json::from_slice(payload)
            .map(Some)
            .map_err(|e| FrameError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Probe {
        name: String,
        seq: u32,
    }

    fn probe(seq: u32) -> Probe {
        Probe {
            name: "probe".to_string(),
            seq,
        }
    }

    #[test]
    fn test_decode_across_partial_pushes() {
        let encoded = encode(&probe(1)).unwrap();
        let mut decoder = FrameDecoder::new();

        decoder.push(&encoded[..3]);
        assert_eq!(decoder.decode::<Probe>().unwrap(), None);
        decoder.push(&encoded[3..HEADER_SIZE + 2]);
        assert_eq!(decoder.decode::<Probe>().unwrap(), None);
        decoder.push(&encoded[HEADER_SIZE + 2..]);
        assert_eq!(decoder.decode::<Probe>().unwrap(), Some(probe(1)));
        assert_eq!(decoder.available(), 0);
    }

    #[test]
    fn test_corrupted_frame_is_skipped() {
        let mut bad = encode(&probe(1)).unwrap();
        let last = bad.len() - 2;
        bad[last] ^= 0xff;
        let good = encode(&probe(2)).unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.push(&bad);
        decoder.push(&good);

        let err = decoder.decode::<Probe>().unwrap_err();
        assert!(matches!(err, FrameError::ChecksumMismatch { .. }));
        assert!(err.is_recoverable());
        assert_eq!(decoder.decode::<Probe>().unwrap(), Some(probe(2)));
    }

    #[test]
    fn test_wrong_shape_is_skipped() {
        let wrong = encode(&serde_json::json!({"unexpected": true})).unwrap();
        let good = encode(&probe(3)).unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.push(&wrong);
        decoder.push(&good);

        assert!(matches!(
            decoder.decode::<Probe>(),
            Err(FrameError::Malformed(_))
        ));
        assert_eq!(decoder.decode::<Probe>().unwrap(), Some(probe(3)));
    }

    #[test]
    fn test_oversized_length_is_fatal() {
        let mut decoder = FrameDecoder::new();
        let len = (MAX_FRAME_SIZE as u32) + 1;
        decoder.push(&len.to_be_bytes());
        decoder.push(&[0, 0, 0, 0]);

        let err = decoder.decode::<Probe>().unwrap_err();
        assert_eq!(err, FrameError::TooLarge(MAX_FRAME_SIZE + 1));
        assert!(!err.is_recoverable());
    }
}
