//! Infrastructure layer for the bridge host.
//!
//! Contains OS-facing adapters: serial ports, USB device enumeration, and
//! file-system storage for the host config and profile records.

pub mod device_monitor;
pub mod storage;
pub mod transport;
