//! Scriptable device source for testing.
//!
//! Tests "plug" and "unplug" devices on a shared [`StaticDeviceSource`]
//! handle while the monitor polls a clone of it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::{DeviceCandidate, DeviceSource, MonitorError};

/// A [`DeviceSource`] whose device list is set by the test.
#[derive(Clone, Default)]
pub struct StaticDeviceSource {
    devices: Arc<Mutex<Vec<DeviceCandidate>>>,
    failing: Arc<Mutex<bool>>,
    plugs: Arc<AtomicU64>,
}

impl StaticDeviceSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a USB device; plugging an already present path replaces it.
    /// Every plug gets a new plug id, like a real re-insertion.
    pub fn plug(&self, path: &str, vendor_id: u16, product_id: u16) {
        let plug = self.plugs.fetch_add(1, Ordering::SeqCst) + 1;
        let mut devices = self.devices.lock().expect("lock poisoned");
        devices.retain(|d| d.path != path);
        devices.push(
            DeviceCandidate::usb(path, vendor_id, product_id).with_plug_id(format!("plug-{plug}")),
        );
    }

    pub fn unplug(&self, path: &str) {
        self.devices
            .lock()
            .expect("lock poisoned")
            .retain(|d| d.path != path);
    }

    /// Makes every following enumeration fail until reset.
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().expect("lock poisoned") = failing;
    }
}

impl DeviceSource for StaticDeviceSource {
    fn enumerate(&self) -> Result<Vec<DeviceCandidate>, MonitorError> {
        if *self.failing.lock().expect("lock poisoned") {
            return Err(MonitorError::Enumerate("scripted failure".to_string()));
        }
        Ok(self.devices.lock().expect("lock poisoned").clone())
    }
}
