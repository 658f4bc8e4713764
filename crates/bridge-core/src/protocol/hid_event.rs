//! HID event-forwarding frames.
//!
//! Events travel in the same `[magic][type][length][payload]` frame as
//! control commands.  The type byte is the [`HidEventType`] and the payload is
//! one of three fixed-size HID reports:
//!
//! | Event | Report | Payload bytes |
//! |---|---|---|
//! | `KeyboardPress` / `KeyboardRelease` | [`KeyboardReport`] | 8 |
//! | `MouseMove` / `MouseButtonPress` / `MouseButtonRelease` | [`MouseReport`] | 3 |
//! | `MouseScroll` | [`MouseWheelReport`] | 2 |
//!
//! # HID reports (for beginners)
//!
//! A USB keyboard does not send "the A key went down".  It sends a *report*:
//! a snapshot of which modifier keys are held (one bit each) plus up to six
//! usage IDs for the other keys currently pressed.  The bridge replays these
//! reports on its USB device side, so the host only has to forward them.

use thiserror::Error;

use crate::protocol::frame::{decode_frame, encode_frame, Frame, FrameError};

/// Errors produced when building or parsing an event frame.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HidEventError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("unknown HID event type: 0x{0:02X}")]
    UnknownEventType(u8),

    #[error("{event:?} payload must be {expected} bytes, got {actual}")]
    BadPayloadLength {
        event: HidEventType,
        expected: usize,
        actual: usize,
    },
}

/// Event type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HidEventType {
    KeyboardPress = 0x01,
    KeyboardRelease = 0x02,
    MouseMove = 0x03,
    MouseButtonPress = 0x04,
    MouseButtonRelease = 0x05,
    MouseScroll = 0x06,
}

impl TryFrom<u8> for HidEventType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(HidEventType::KeyboardPress),
            0x02 => Ok(HidEventType::KeyboardRelease),
            0x03 => Ok(HidEventType::MouseMove),
            0x04 => Ok(HidEventType::MouseButtonPress),
            0x05 => Ok(HidEventType::MouseButtonRelease),
            0x06 => Ok(HidEventType::MouseScroll),
            _ => Err(()),
        }
    }
}

/// Boot-protocol keyboard report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeyboardReport {
    /// Modifier bitmask (bit 0 = left ctrl … bit 7 = right GUI).
    pub modifiers: u8,
    pub reserved: u8,
    /// Usage IDs of pressed keys; unused slots are zero.
    pub keycodes: [u8; 6],
}

impl KeyboardReport {
    pub const LEN: usize = 8;

    fn write(&self, buf: &mut Vec<u8>) {
        buf.push(self.modifiers);
        buf.push(self.reserved);
        buf.extend_from_slice(&self.keycodes);
    }

    fn read(p: &[u8]) -> Self {
        let mut keycodes = [0u8; 6];
        keycodes.copy_from_slice(&p[2..8]);
        Self {
            modifiers: p[0],
            reserved: p[1],
            keycodes,
        }
    }
}

/// Relative mouse report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MouseReport {
    /// Button bitmask (bit 0 = left, bit 1 = right, bit 2 = middle).
    pub buttons: u8,
    pub x: i8,
    pub y: i8,
}

impl MouseReport {
    pub const LEN: usize = 3;

    fn write(&self, buf: &mut Vec<u8>) {
        buf.push(self.buttons);
        buf.extend_from_slice(&self.x.to_le_bytes());
        buf.extend_from_slice(&self.y.to_le_bytes());
    }

    fn read(p: &[u8]) -> Self {
        Self {
            buttons: p[0],
            x: i8::from_le_bytes([p[1]]),
            y: i8::from_le_bytes([p[2]]),
        }
    }
}

/// Vertical and horizontal wheel report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MouseWheelReport {
    pub wheel: i8,
    pub hwheel: i8,
}

impl MouseWheelReport {
    pub const LEN: usize = 2;
}

/// One event ready to be forwarded to the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HidEventPacket {
    KeyboardPress(KeyboardReport),
    KeyboardRelease(KeyboardReport),
    MouseMove(MouseReport),
    MouseButtonPress(MouseReport),
    MouseButtonRelease(MouseReport),
    MouseScroll(MouseWheelReport),
}

impl HidEventPacket {
    pub fn event_type(&self) -> HidEventType {
        match self {
            HidEventPacket::KeyboardPress(_) => HidEventType::KeyboardPress,
            HidEventPacket::KeyboardRelease(_) => HidEventType::KeyboardRelease,
            HidEventPacket::MouseMove(_) => HidEventType::MouseMove,
            HidEventPacket::MouseButtonPress(_) => HidEventType::MouseButtonPress,
            HidEventPacket::MouseButtonRelease(_) => HidEventType::MouseButtonRelease,
            HidEventPacket::MouseScroll(_) => HidEventType::MouseScroll,
        }
    }

    /// Report payload without the frame header.
    pub fn payload(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(KeyboardReport::LEN);
        match self {
            HidEventPacket::KeyboardPress(r) | HidEventPacket::KeyboardRelease(r) => r.write(&mut buf),
            HidEventPacket::MouseMove(r)
            | HidEventPacket::MouseButtonPress(r)
            | HidEventPacket::MouseButtonRelease(r) => r.write(&mut buf),
            HidEventPacket::MouseScroll(r) => {
                buf.extend_from_slice(&r.wheel.to_le_bytes());
                buf.extend_from_slice(&r.hwheel.to_le_bytes());
            }
        }
        buf
    }

    /// Serializes the event as a complete wire frame.
    ///
    /// # Errors
    ///
    /// Never fails in practice (reports are at most 8 bytes); the frame codec
    /// error is propagated for uniformity.
    pub fn serialize(&self) -> Result<Vec<u8>, HidEventError> {
        Ok(encode_frame(self.event_type() as u8, &self.payload())?)
    }

    /// Parses one event frame from the start of `bytes`, returning the event
    /// and the number of bytes consumed.
    ///
    /// # Errors
    ///
    /// Returns [`HidEventError`] for frame errors, unknown types, or a payload
    /// of the wrong size for its type.
    pub fn parse(bytes: &[u8]) -> Result<(Self, usize), HidEventError> {
        let (frame, consumed) = decode_frame(bytes)?;
        Ok((Self::from_frame(&frame)?, consumed))
    }

    /// Interprets an already-decoded frame as an event.
    ///
    /// # Errors
    ///
    /// See [`HidEventPacket::parse`].
    pub fn from_frame(frame: &Frame) -> Result<Self, HidEventError> {
        let event = HidEventType::try_from(frame.frame_type)
            .map_err(|_| HidEventError::UnknownEventType(frame.frame_type))?;
        let p = frame.payload.as_slice();
        let expected = match event {
            HidEventType::KeyboardPress | HidEventType::KeyboardRelease => KeyboardReport::LEN,
            HidEventType::MouseScroll => MouseWheelReport::LEN,
            _ => MouseReport::LEN,
        };
        if p.len() != expected {
            return Err(HidEventError::BadPayloadLength {
                event,
                expected,
                actual: p.len(),
            });
        }

        Ok(match event {
            HidEventType::KeyboardPress => HidEventPacket::KeyboardPress(KeyboardReport::read(p)),
            HidEventType::KeyboardRelease => HidEventPacket::KeyboardRelease(KeyboardReport::read(p)),
            HidEventType::MouseMove => HidEventPacket::MouseMove(MouseReport::read(p)),
            HidEventType::MouseButtonPress => HidEventPacket::MouseButtonPress(MouseReport::read(p)),
            HidEventType::MouseButtonRelease => {
                HidEventPacket::MouseButtonRelease(MouseReport::read(p))
            }
            HidEventType::MouseScroll => HidEventPacket::MouseScroll(MouseWheelReport {
                wheel: i8::from_le_bytes([p[0]]),
                hwheel: i8::from_le_bytes([p[1]]),
            }),
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
