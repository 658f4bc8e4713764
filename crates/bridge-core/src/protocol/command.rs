//! Control-channel command codes.
//!
//! Command frames share the frame layout with HID event frames; command codes
//! live in `0x10..=0x1F` so they never collide with event codes `0x01..=0x06`.
//! A new command always gets a new code.

use serde::{Deserialize, Serialize};

use crate::protocol::frame::Frame;

/// Protocol version the host announces in its handshake.
pub const HOST_PROTOCOL_VERSION: u8 = 0x01;

/// Control-channel frame types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CommandCode {
    Handshake = 0x10,
    HandshakeAck = 0x11,
    SerialQuery = 0x12,
    SerialResponse = 0x13,
    NameQuery = 0x14,
    NameResponse = 0x15,
    ConfigQuery = 0x16,
    ConfigResponse = 0x17,
    /// Device does not implement the command named in `payload[0]`.
    Nack = 0x1F,
}

impl CommandCode {
    /// Response type a device sends for this request, if it is a request.
    pub fn expected_response(self) -> Option<CommandCode> {
        match self {
            CommandCode::Handshake => Some(CommandCode::HandshakeAck),
            CommandCode::SerialQuery => Some(CommandCode::SerialResponse),
            CommandCode::NameQuery => Some(CommandCode::NameResponse),
            CommandCode::ConfigQuery => Some(CommandCode::ConfigResponse),
            _ => None,
        }
    }

    /// Builds the request frame for this command.
    pub fn request_frame(self) -> Frame {
        match self {
            CommandCode::Handshake => Frame::new(self as u8, vec![HOST_PROTOCOL_VERSION]),
            _ => Frame::new(self as u8, Vec::new()),
        }
    }
}

impl TryFrom<u8> for CommandCode {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x10 => Ok(CommandCode::Handshake),
            0x11 => Ok(CommandCode::HandshakeAck),
            0x12 => Ok(CommandCode::SerialQuery),
            0x13 => Ok(CommandCode::SerialResponse),
            0x14 => Ok(CommandCode::NameQuery),
            0x15 => Ok(CommandCode::NameResponse),
            0x16 => Ok(CommandCode::ConfigQuery),
            0x17 => Ok(CommandCode::ConfigResponse),
            0x1F => Ok(CommandCode::Nack),
            _ => Err(()),
        }
    }
}
