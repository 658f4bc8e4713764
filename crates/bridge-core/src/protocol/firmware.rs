//! Firmware configuration payload carried by `HandshakeAck` and `ConfigResponse`.
//!
//! Layout (little-endian):
//! ```text
//! [protocol_version:1][hid_connected:1][host_os:1][ble_interval_ms:2]
//! [production_activated:1][firmware_bcd:2][hardware_bcd:2]
//! [name_len:1][name:name_len]          <- optional suffix
//! ```
//!
//! Older firmware omits the name suffix; the name is then fetched separately
//! with a `NameQuery`.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Size of the fixed part of the payload.
pub const FIRMWARE_CONFIG_MIN_LEN: usize = 10;

/// Errors produced when parsing a [`FirmwareConfig`] payload.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FirmwareConfigError {
    #[error("firmware config payload too short: need {needed} bytes, got {available}")]
    TooShort { needed: usize, available: usize },

    #[error("firmware config device name is not valid UTF-8")]
    InvalidName,

    #[error("device name too long: {len} bytes")]
    NameTooLong { len: usize },
}

/// Operating system the bridge reports for the host it is plugged into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum HostOs {
    #[default]
    Unknown = 0,
    Windows = 1,
    MacOs = 2,
    Linux = 3,
    Ios = 4,
    Android = 5,
}

impl From<u8> for HostOs {
    fn from(value: u8) -> Self {
        match value {
            1 => HostOs::Windows,
            2 => HostOs::MacOs,
            3 => HostOs::Linux,
            4 => HostOs::Ios,
            5 => HostOs::Android,
            _ => HostOs::Unknown,
        }
    }
}

impl HostOs {
    pub fn as_str(self) -> &'static str {
        match self {
            HostOs::Unknown => "Unknown",
            HostOs::Windows => "Windows",
            HostOs::MacOs => "macOS",
            HostOs::Linux => "Linux",
            HostOs::Ios => "iOS",
            HostOs::Android => "Android",
        }
    }
}

/// Decoded handshake configuration snapshot.
///
/// Immutable once decoded; a reconnect fetches a fresh one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FirmwareConfig {
    pub protocol_version: u8,
    pub hid_connected: bool,
    pub host_os: HostOs,
    pub ble_interval_ms: u16,
    pub production_activated: bool,
    pub firmware_version_bcd: u16,
    pub hardware_version_bcd: u16,
    /// Empty when the firmware did not include the name suffix.
    pub device_name: String,
}

impl FirmwareConfig {
    /// Parses a payload.
    ///
    /// # Errors
    ///
    /// Returns [`FirmwareConfigError`] if the fixed part is short or the name
    /// suffix is inconsistent.
    pub fn decode(p: &[u8]) -> Result<Self, FirmwareConfigError> {
        if p.len() < FIRMWARE_CONFIG_MIN_LEN {
            return Err(FirmwareConfigError::TooShort {
                needed: FIRMWARE_CONFIG_MIN_LEN,
                available: p.len(),
            });
        }

        if p[2] > HostOs::Android as u8 {
            debug!("firmware reported unknown host OS tag {}", p[2]);
        }

        let device_name = if p.len() > FIRMWARE_CONFIG_MIN_LEN {
            let name_len = p[FIRMWARE_CONFIG_MIN_LEN] as usize;
            let start = FIRMWARE_CONFIG_MIN_LEN + 1;
            if p.len() < start + name_len {
                return Err(FirmwareConfigError::TooShort {
                    needed: start + name_len,
                    available: p.len(),
                });
            }
            std::str::from_utf8(&p[start..start + name_len])
                .map_err(|_| FirmwareConfigError::InvalidName)?
                .to_string()
        } else {
            String::new()
        };

        Ok(Self {
            protocol_version: p[0],
            hid_connected: p[1] != 0,
            host_os: HostOs::from(p[2]),
            ble_interval_ms: u16::from_le_bytes([p[3], p[4]]),
            production_activated: p[5] != 0,
            firmware_version_bcd: u16::from_le_bytes([p[6], p[7]]),
            hardware_version_bcd: u16::from_le_bytes([p[8], p[9]]),
            device_name,
        })
    }

    /// Encodes to the wire layout.  The name suffix is written only when the
    /// name is non-empty.
    ///
    /// # Errors
    ///
    /// Returns [`FirmwareConfigError::NameTooLong`] if the name does not fit a
    /// single frame.
    pub fn encode(&self) -> Result<Vec<u8>, FirmwareConfigError> {
        let name = self.device_name.as_bytes();
        // One frame: 255 payload bytes minus the fixed part and the length byte.
        if name.len() > u8::MAX as usize - FIRMWARE_CONFIG_MIN_LEN - 1 {
            return Err(FirmwareConfigError::NameTooLong { len: name.len() });
        }

        let mut buf = Vec::with_capacity(FIRMWARE_CONFIG_MIN_LEN + 1 + name.len());
        buf.push(self.protocol_version);
        buf.push(u8::from(self.hid_connected));
        buf.push(self.host_os as u8);
        buf.extend_from_slice(&self.ble_interval_ms.to_le_bytes());
        buf.push(u8::from(self.production_activated));
        buf.extend_from_slice(&self.firmware_version_bcd.to_le_bytes());
        buf.extend_from_slice(&self.hardware_version_bcd.to_le_bytes());
        if !name.is_empty() {
            buf.push(name.len() as u8);
            buf.extend_from_slice(name);
        }
        Ok(buf)
    }

    pub fn host_os_string(&self) -> &'static str {
        self.host_os.as_str()
    }

    pub fn firmware_version(&self) -> String {
        format_bcd_version(self.firmware_version_bcd)
    }

    pub fn hardware_version(&self) -> String {
        format_bcd_version(self.hardware_version_bcd)
    }
}

/// Formats a BCD `major.minor` version: `0x0102` → `"1.2"`, `0x1203` → `"12.3"`.
pub fn format_bcd_version(bcd: u16) -> String {
    let [major, minor] = bcd.to_be_bytes();
    format!("{}.{}", bcd_byte(major), bcd_byte(minor))
}

fn bcd_byte(b: u8) -> u32 {
    u32::from(b >> 4) * 10 + u32::from(b & 0x0F)
}
