//! Observed USB devices and the bridge signature policy.
//!
//! A bridge enumerates as a CDC-ACM serial port.  Its USB vendor/product pair
//! identifies it; the serial number is *not* known from enumeration and only
//! arrives after a successful handshake over the serial link.

use serde::{Deserialize, Serialize};

/// Espressif Systems USB vendor ID.
pub const ESPRESSIF_VENDOR_ID: u16 = 0x303A;

/// Product ID the bridge firmware enumerates with.
pub const BRIDGE_PRODUCT_ID: u16 = 0x1001;

/// A currently-or-recently observed physical device, keyed by its path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbDeviceRecord {
    /// OS device path, e.g. `/dev/ttyACM0` or `COM3`.
    pub path: String,
    pub vendor_id: u16,
    pub product_id: u16,
    /// Filled in only after a successful identification.
    pub serial_number: Option<String>,
}

impl UsbDeviceRecord {
    pub fn new(path: impl Into<String>, vendor_id: u16, product_id: u16) -> Self {
        Self {
            path: path.into(),
            vendor_id,
            product_id,
            serial_number: None,
        }
    }
}

/// Vendor/product pair a bridge is expected to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSignature {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl Default for DeviceSignature {
    fn default() -> Self {
        Self {
            vendor_id: ESPRESSIF_VENDOR_ID,
            product_id: BRIDGE_PRODUCT_ID,
        }
    }
}

/// How well a device's ids match a [`DeviceSignature`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureMatch {
    /// Vendor and product both match.
    Exact,
    /// Vendor matches, product does not (other firmware builds on the same chip).
    VendorOnly,
    NoMatch,
}

impl DeviceSignature {
    /// Classifies a device.  Missing ids never match.
    pub fn classify(&self, vendor_id: Option<u16>, product_id: Option<u16>) -> SignatureMatch {
        match (vendor_id, product_id) {
            (Some(v), Some(p)) if v == self.vendor_id && p == self.product_id => {
                SignatureMatch::Exact
            }
            (Some(v), _) if v == self.vendor_id => SignatureMatch::VendorOnly,
            _ => SignatureMatch::NoMatch,
        }
    }

    /// Whether a classified device is accepted under the given policy.
    pub fn accepts(&self, matched: SignatureMatch, strict_product_match: bool) -> bool {
        match matched {
            SignatureMatch::Exact => true,
            SignatureMatch::VendorOnly => !strict_product_match,
            SignatureMatch::NoMatch => false,
        }
    }
}

/// Parses a USB id as written in sysfs (`"303a\n"`) or config (`"0x303A"`).
pub fn parse_usb_id(text: &str) -> Option<u16> {
    let trimmed = text.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if digits.is_empty() {
        return None;
    }
    u16::from_str_radix(digits, 16).ok()
}
