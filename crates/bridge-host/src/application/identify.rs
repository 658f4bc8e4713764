//! Use case: find out which physical bridge sits behind a device path.
//!
//! Identification means opening the control channel, handshaking, and
//! reading the serial number and display name.  The arbiter does not care
//! *how* that happens; it only sees an [`IdentifyOutcome`].  The production
//! implementation talks to the serial port
//! (`infrastructure::transport::identifier::SerialIdentifier`); tests script
//! outcomes directly.
//!
//! # Outcomes are not errors (for beginners)
//!
//! A busy port (another program has it open) or a firmware that does not
//! answer in time are everyday situations when USB devices come and go.  They
//! are reported as ordinary enum variants so the arbiter can decide to retry,
//! rather than as `Err` values that suggest something went wrong in the host.

use async_trait::async_trait;
use bridge_core::FirmwareConfig;
use serde::Serialize;

/// What a successful identification learned about the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub serial: String,
    /// `None` when the firmware did not report a name.
    pub device_name: Option<String>,
    /// `None` for older firmware that sends a bare handshake ACK.
    pub config: Option<FirmwareConfig>,
}

/// Why a present device is not identified yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingReason {
    /// Another process holds the port; retried on every poll tick.
    Busy,
    /// The firmware did not answer in time; retried only on refresh.
    TimedOut,
    /// Open failed for another reason, or the firmware answered with
    /// something unusable; retried only on refresh.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentifyOutcome {
    Identified(DeviceIdentity),
    Busy,
    TimedOut,
    Failed(String),
}

impl IdentifyOutcome {
    /// The pending reason for every outcome except `Identified`.
    pub fn pending_reason(&self) -> Option<PendingReason> {
        match self {
            IdentifyOutcome::Identified(_) => None,
            IdentifyOutcome::Busy => Some(PendingReason::Busy),
            IdentifyOutcome::TimedOut => Some(PendingReason::TimedOut),
            IdentifyOutcome::Failed(_) => Some(PendingReason::Failed),
        }
    }
}

/// Identifies the bridge at a device path.
#[async_trait]
pub trait DeviceIdentifier: Send + Sync {
    async fn identify(&self, path: &str) -> IdentifyOutcome;
}
