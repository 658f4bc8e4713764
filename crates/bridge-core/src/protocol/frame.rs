//! Frame codec for the bridge serial control channel.
//!
//! Wire format:
//! ```text
//! [magic:2 = 0xAA55 LE][type:1][length:1][payload:length]
//! ```
//! The magic is stored little-endian, so the first byte on the wire is `0x55`
//! and the second is `0xAA`.
//!
//! # Reading a byte stream (for beginners)
//!
//! A serial port delivers bytes in arbitrary chunks: one `read` may return
//! half a frame, the next may return the rest of it plus the start of the
//! following frame.  [`decode_frame`] is stateless and only looks at the
//! beginning of the slice it is given:
//!
//! - `Ok((frame, consumed))` – a complete frame; drop `consumed` bytes from
//!   your buffer and call again for the next one.
//! - `Err(FrameError::Truncated { .. })` – not enough bytes yet; read more.
//! - `Err(FrameError::BadMagic { .. })` – the stream is out of sync.

use thiserror::Error;

/// Magic marker at the start of every frame.
pub const FRAME_MAGIC: u16 = 0xAA55;

/// Size of the fixed header (magic + type + length).
pub const FRAME_HEADER_SIZE: usize = 4;

/// Largest payload a single frame can carry (the length field is one byte).
pub const MAX_PAYLOAD_LEN: usize = u8::MAX as usize;

/// Errors produced by [`encode_frame`] and [`decode_frame`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The first two bytes are not the frame magic.
    #[error("bad frame magic: 0x{found:04X}")]
    BadMagic { found: u16 },

    /// Fewer bytes are available than the header or the length field declares.
    #[error("truncated frame: need {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },

    /// The payload does not fit the one-byte length field.
    #[error("payload too large: {len} bytes (max {MAX_PAYLOAD_LEN})")]
    PayloadTooLarge { len: usize },
}

/// One decoded frame: a type code and its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(frame_type: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            frame_type,
            payload: payload.into(),
        }
    }

    /// Encodes this frame to wire bytes.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::PayloadTooLarge`] if the payload exceeds 255 bytes.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        encode_frame(self.frame_type, &self.payload)
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes a frame of `frame_type` carrying `payload`.
///
/// # Errors
///
/// Returns [`FrameError::PayloadTooLarge`] when `payload.len() > 255`.
///
/// # Examples
///
/// ```rust
/// use bridge_core::protocol::frame::{decode_frame, encode_frame};
///
/// let bytes = encode_frame(0x12, b"").unwrap();
/// assert_eq!(bytes, vec![0x55, 0xAA, 0x12, 0x00]);
/// let (frame, consumed) = decode_frame(&bytes).unwrap();
/// assert_eq!(frame.frame_type, 0x12);
/// assert_eq!(consumed, 4);
/// ```
pub fn encode_frame(frame_type: u8, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(FrameError::PayloadTooLarge { len: payload.len() });
    }

    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&FRAME_MAGIC.to_le_bytes());
    buf.push(frame_type);
    buf.push(payload.len() as u8);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Decodes one frame from the beginning of `bytes`.
///
/// Returns the frame and the number of bytes it occupied.  Trailing bytes
/// after the frame are left untouched.
///
/// # Errors
///
/// - [`FrameError::BadMagic`] if the first two bytes are not `55 AA`.
/// - [`FrameError::Truncated`] if the header or the declared payload is
///   incomplete.
pub fn decode_frame(bytes: &[u8]) -> Result<(Frame, usize), FrameError> {
    if bytes.len() < 2 {
        return Err(FrameError::Truncated {
            needed: FRAME_HEADER_SIZE,
            available: bytes.len(),
        });
    }

    let magic = u16::from_le_bytes([bytes[0], bytes[1]]);
    if magic != FRAME_MAGIC {
        return Err(FrameError::BadMagic { found: magic });
    }

    if bytes.len() < FRAME_HEADER_SIZE {
        return Err(FrameError::Truncated {
            needed: FRAME_HEADER_SIZE,
            available: bytes.len(),
        });
    }

    let frame_type = bytes[2];
    let payload_len = bytes[3] as usize;
    let total = FRAME_HEADER_SIZE + payload_len;
    if bytes.len() < total {
        return Err(FrameError::Truncated {
            needed: total,
            available: bytes.len(),
        });
    }

    let payload = bytes[FRAME_HEADER_SIZE..total].to_vec();
    Ok((Frame { frame_type, payload }, total))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_writes_magic_little_endian() {
        let bytes = encode_frame(0x10, &[0x01]).unwrap();
        assert_eq!(bytes, vec![0x55, 0xAA, 0x10, 0x01, 0x01]);
    }

    #[test]
    fn test_encode_empty_payload_is_header_only() {
        let bytes = encode_frame(0x12, &[]).unwrap();
        assert_eq!(bytes.len(), FRAME_HEADER_SIZE);
        assert_eq!(bytes[3], 0);
    }

    #[test]
    fn test_encode_max_payload_succeeds() {
        // Arrange
        let payload = vec![0xCD; MAX_PAYLOAD_LEN];

        // Act
        let bytes = encode_frame(0x13, &payload).unwrap();

        // Assert
        assert_eq!(bytes.len(), FRAME_HEADER_SIZE + 255);
        assert_eq!(bytes[3], 0xFF);
    }

    #[test]
    fn test_encode_oversized_payload_fails() {
        let payload = vec![0u8; 256];
        assert_eq!(
            encode_frame(0x13, &payload),
            Err(FrameError::PayloadTooLarge { len: 256 })
        );
    }

    // ── decode ────────────────────────────────────────────────────────────────

    #[test]
    fn test_decode_rejects_bad_magic() {
        let err = decode_frame(&[0xAA, 0x55, 0x10, 0x00]).unwrap_err();
        assert_eq!(err, FrameError::BadMagic { found: 0x55AA });
    }

    #[test]
    fn test_decode_single_byte_is_truncated_not_bad_magic() {
        let err = decode_frame(&[0x55]).unwrap_err();
        assert!(matches!(err, FrameError::Truncated { available: 1, .. }));
    }

    #[test]
    fn test_decode_incomplete_header_is_truncated() {
        let err = decode_frame(&[0x55, 0xAA, 0x10]).unwrap_err();
        assert_eq!(
            err,
            FrameError::Truncated {
                needed: 4,
                available: 3
            }
        );
    }

    #[test]
    fn test_decode_short_payload_is_truncated() {
        // Arrange: header declares 5 payload bytes, only 2 present
        let bytes = [0x55, 0xAA, 0x13, 0x05, b'B', b'R'];

        // Act
        let err = decode_frame(&bytes).unwrap_err();

        // Assert
        assert_eq!(
            err,
            FrameError::Truncated {
                needed: 9,
                available: 6
            }
        );
    }

    #[test]
    fn test_decode_tolerates_trailing_bytes() {
        // Arrange: one complete frame followed by the start of another
        let mut bytes = encode_frame(0x13, b"BR1234").unwrap();
        bytes.extend_from_slice(&[0x55, 0xAA, 0x15]);

        // Act
        let (frame, consumed) = decode_frame(&bytes).unwrap();

        // Assert
        assert_eq!(frame, Frame::new(0x13, b"BR1234".to_vec()));
        assert_eq!(consumed, 10);
        assert!(matches!(
            decode_frame(&bytes[consumed..]),
            Err(FrameError::Truncated { .. })
        ));
    }

    #[test]
    fn test_frame_encode_matches_free_function() {
        let frame = Frame::new(0x16, vec![1, 2, 3]);
        assert_eq!(frame.encode().unwrap(), encode_frame(0x16, &[1, 2, 3]).unwrap());
    }
}
