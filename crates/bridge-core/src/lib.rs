//! # bridge-core
//!
//! Shared library for the USB HID bridge host containing the serial frame
//! codec, firmware payload types, and domain entities.
//!
//! It has zero dependencies on OS APIs, serial ports, or the file system.
//!
//! # Architecture overview (for beginners)
//!
//! A *bridge* is a small USB microcontroller that plugs into a host computer.
//! It exposes a CDC serial port used as a control channel, and it replays
//! keyboard and mouse HID reports it receives over that channel.  The host
//! application needs to find bridges, ask each one who it is, and bind it to
//! a saved profile.
//!
//! This crate (`bridge-core`) is the shared foundation.  It defines:
//!
//! - **`protocol`** – How bytes travel over the serial link.  Every message is
//!   a small frame (4-byte header + up to 255 payload bytes); commands,
//!   firmware configuration, and HID event reports all ride in frames.
//!
//! - **`domain`** – Which USB devices are bridges ([`DeviceSignature`]) and
//!   what a persisted [`BridgeProfile`] with its screen bondings looks like.

pub mod domain;
pub mod protocol;

pub use domain::device::{
    parse_usb_id, DeviceSignature, SignatureMatch, UsbDeviceRecord, BRIDGE_PRODUCT_ID,
    ESPRESSIF_VENDOR_ID,
};
pub use domain::profile::{
    default_screen_name, normalize_activation_state, normalize_serial, BondingOffset,
    BridgeProfile, ProfileId, ScreenBonding, PROFILE_SCHEMA_VERSION,
};
pub use protocol::command::CommandCode;
pub use protocol::firmware::{FirmwareConfig, HostOs};
pub use protocol::frame::{decode_frame, encode_frame, Frame, FrameError};
pub use protocol::hid_event::HidEventPacket;
