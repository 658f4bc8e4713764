//! Serial protocol: frame codec, command codes, and payload types.

pub mod command;
pub mod firmware;
pub mod frame;
pub mod hid_event;

pub use command::{CommandCode, HOST_PROTOCOL_VERSION};
pub use firmware::{FirmwareConfig, FirmwareConfigError, HostOs};
pub use frame::{decode_frame, encode_frame, Frame, FrameError, MAX_PAYLOAD_LEN};
pub use hid_event::{
    HidEventError, HidEventPacket, HidEventType, KeyboardReport, MouseReport, MouseWheelReport,
};
