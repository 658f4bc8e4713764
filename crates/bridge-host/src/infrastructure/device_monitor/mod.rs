//! Device-presence watcher for bridge devices.
//!
//! [`DeviceMonitor`] keeps the live table `path → UsbDeviceRecord` and turns
//! platform enumeration into [`DeviceEvent`]s.
//!
//! # Why departures are matched by path (for beginners)
//!
//! When a USB device is unplugged, the OS tells you *which path* went away,
//! but the device is already gone: you can no longer read its vendor or
//! product id.  So the monitor remembers every device it accepted on arrival,
//! and a departure is simply "is this path in my table?".  A departure for a
//! path the monitor never accepted (some other serial adapter) is ignored.
//!
//! # Platform sources
//!
//! Enumeration differs per OS and sits behind the [`DeviceSource`] trait:
//!
//! - Linux: [`sysfs::SysfsSource`] reads USB ids straight from `/sys`.
//! - Everything else: [`serialport_source::SerialPortSource`].
//! - Tests: [`mock::StaticDeviceSource`] or the `mockall`-generated mock.
//!
//! Live updates come from re-enumerating on every poll tick and diffing the
//! result against the table; notifications from elsewhere can be fed in with
//! [`DeviceMonitor::apply`], which applies the same de-duplication.
//!
//! # Replugs between ticks
//!
//! A bridge unplugged and plugged back in (or swapped for another one) fast
//! enough can reappear under the same path before the next poll.  Sources
//! that can tell plugs apart report a [`DeviceCandidate::plug_id`]; when the
//! id recorded for a path changes, the poll reports a departure followed by a
//! fresh arrival, so nothing learned about the old device survives.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use bridge_core::{DeviceSignature, SignatureMatch, UsbDeviceRecord};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod mock;
pub mod serialport_source;
pub mod sysfs;

/// Errors produced while enumerating devices.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("device enumeration failed: {0}")]
    Enumerate(String),
}

/// One serial device as reported by a [`DeviceSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCandidate {
    pub path: String,
    /// `None` when the id could not be read (non-USB port, sysfs gap).
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    /// Changes every time a device is plugged in at this path.  `None` when
    /// the source cannot tell one plug from the next.
    pub plug_id: Option<String>,
}

impl DeviceCandidate {
    pub fn usb(path: impl Into<String>, vendor_id: u16, product_id: u16) -> Self {
        Self {
            path: path.into(),
            vendor_id: Some(vendor_id),
            product_id: Some(product_id),
            plug_id: None,
        }
    }

    pub fn with_plug_id(mut self, plug_id: impl Into<String>) -> Self {
        self.plug_id = Some(plug_id.into());
        self
    }
}

/// Platform enumeration of serial devices.
#[cfg_attr(test, mockall::automock)]
pub trait DeviceSource: Send {
    /// Lists every serial device currently present, bridge or not.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError`] if the platform listing itself fails.
    fn enumerate(&self) -> Result<Vec<DeviceCandidate>, MonitorError>;
}

/// Presence change of a bridge device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceEvent {
    Arrived {
        path: String,
        vendor_id: u16,
        product_id: u16,
    },
    Departed {
        path: String,
    },
}

impl DeviceEvent {
    pub fn path(&self) -> &str {
        match self {
            DeviceEvent::Arrived { path, .. } | DeviceEvent::Departed { path } => path,
        }
    }
}

/// Returns the enumeration source for the current platform.
pub fn default_source() -> Box<dyn DeviceSource> {
    #[cfg(target_os = "linux")]
    {
        Box::new(sysfs::SysfsSource::default())
    }

    #[cfg(not(target_os = "linux"))]
    {
        Box::new(serialport_source::SerialPortSource)
    }
}

/// Live table of present bridge devices.
pub struct DeviceMonitor {
    source: Box<dyn DeviceSource>,
    signature: DeviceSignature,
    strict_product_match: bool,
    devices: HashMap<String, UsbDeviceRecord>,
    /// Plug id seen when each present path arrived.
    plug_ids: HashMap<String, String>,
}

impl DeviceMonitor {
    pub fn new(
        source: Box<dyn DeviceSource>,
        signature: DeviceSignature,
        strict_product_match: bool,
    ) -> Self {
        Self {
            source,
            signature,
            strict_product_match,
            devices: HashMap::new(),
            plug_ids: HashMap::new(),
        }
    }

    /// Re-enumerates and returns what changed since the last poll.
    ///
    /// Departures come first, then arrivals, each ordered by path.
    ///
    /// # Errors
    ///
    /// Propagates the source's [`MonitorError`]; the table is left unchanged.
    pub fn poll(&mut self) -> Result<Vec<DeviceEvent>, MonitorError> {
        let candidates = self.source.enumerate()?;
        let enumerated: BTreeSet<&str> = candidates.iter().map(|c| c.path.as_str()).collect();

        let replugged: BTreeSet<&str> = candidates
            .iter()
            .filter(|c| self.devices.contains_key(&c.path) && self.is_replug(c))
            .map(|c| c.path.as_str())
            .collect();

        let mut departed: Vec<String> = self
            .devices
            .keys()
            .filter(|p| !enumerated.contains(p.as_str()) || replugged.contains(p.as_str()))
            .cloned()
            .collect();
        departed.sort();

        let mut fresh: Vec<&DeviceCandidate> = candidates
            .iter()
            .filter(|c| !self.devices.contains_key(&c.path) || replugged.contains(c.path.as_str()))
            .collect();
        fresh.sort_by(|a, b| a.path.cmp(&b.path));
        fresh.dedup_by(|a, b| a.path == b.path);
        let accepted: Vec<DeviceCandidate> = fresh
            .into_iter()
            .filter(|c| self.accepts(c))
            .cloned()
            .collect();

        let mut events = Vec::new();
        for path in departed {
            if replugged.contains(path.as_str()) {
                info!(path = %path, "device at path was replaced between polls");
            }
            if let Some(ev) = self.apply(DeviceEvent::Departed { path }) {
                events.push(ev);
            }
        }
        for c in accepted {
            if let Some(plug_id) = &c.plug_id {
                self.plug_ids.insert(c.path.clone(), plug_id.clone());
            }
            // `accepts` guarantees a vendor id; a missing product id is recorded as 0.
            events.push(self.insert_arrival(
                c.path,
                c.vendor_id.unwrap_or_default(),
                c.product_id.unwrap_or_default(),
            ));
        }
        Ok(events)
    }

    /// Applies one notification to the table.
    ///
    /// Returns the event if it changed the table, `None` if it was a
    /// duplicate arrival, a non-bridge device, or a departure for an unknown
    /// path.
    pub fn apply(&mut self, event: DeviceEvent) -> Option<DeviceEvent> {
        match &event {
            DeviceEvent::Arrived {
                path,
                vendor_id,
                product_id,
            } => {
                if self.devices.contains_key(path) {
                    return None;
                }
                let candidate = DeviceCandidate::usb(path.clone(), *vendor_id, *product_id);
                if !self.accepts(&candidate) {
                    return None;
                }
                Some(self.insert_arrival(candidate.path, *vendor_id, *product_id))
            }
            DeviceEvent::Departed { path } => {
                self.plug_ids.remove(path);
                if self.devices.remove(path).is_none() {
                    debug!(path = %path, "ignoring departure of unknown device");
                    return None;
                }
                info!(path = %path, "bridge device departed");
                Some(event)
            }
        }
    }

    /// Records the serial learned by identification.  Returns `false` if the
    /// path is no longer present.
    pub fn record_serial(&mut self, path: &str, serial: &str) -> bool {
        match self.devices.get_mut(path) {
            Some(record) => {
                record.serial_number = Some(serial.to_string());
                true
            }
            None => false,
        }
    }

    pub fn get(&self, path: &str) -> Option<&UsbDeviceRecord> {
        self.devices.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.devices.contains_key(path)
    }

    /// Present devices ordered by path.
    pub fn devices(&self) -> Vec<UsbDeviceRecord> {
        let mut all: Vec<UsbDeviceRecord> = self.devices.values().cloned().collect();
        all.sort_by(|a, b| a.path.cmp(&b.path));
        all
    }

    fn insert_arrival(&mut self, path: String, vendor_id: u16, product_id: u16) -> DeviceEvent {
        info!(
            path = %path,
            usb_id = %format!("{vendor_id:04x}:{product_id:04x}"),
            "bridge device arrived"
        );
        self.devices.insert(
            path.clone(),
            UsbDeviceRecord::new(path.clone(), vendor_id, product_id),
        );
        DeviceEvent::Arrived {
            path,
            vendor_id,
            product_id,
        }
    }

    /// A known path whose plug id differs from the one it arrived with.
    fn is_replug(&self, c: &DeviceCandidate) -> bool {
        match (self.plug_ids.get(&c.path), &c.plug_id) {
            (Some(known), Some(current)) => known != current,
            _ => false,
        }
    }

    fn accepts(&self, c: &DeviceCandidate) -> bool {
        let matched = self.signature.classify(c.vendor_id, c.product_id);
        let accepted = self.signature.accepts(matched, self.strict_product_match);
        if matched == SignatureMatch::VendorOnly {
            if accepted {
                warn!(
                    path = %c.path,
                    product_id = ?c.product_id,
                    "vendor matches bridge but product id is unexpected; accepting"
                );
            } else {
                debug!(path = %c.path, product_id = ?c.product_id, "rejecting unexpected product id");
            }
        }
        accepted
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_core::{BRIDGE_PRODUCT_ID, ESPRESSIF_VENDOR_ID};
    use mockall::Sequence;

    fn bridge(path: &str) -> DeviceCandidate {
        DeviceCandidate::usb(path, ESPRESSIF_VENDOR_ID, BRIDGE_PRODUCT_ID)
    }

    fn monitor_with(source: MockDeviceSource) -> DeviceMonitor {
        DeviceMonitor::new(Box::new(source), DeviceSignature::default(), false)
    }

    // ── poll ──────────────────────────────────────────────────────────────────

    #[test]
    fn test_initial_poll_reports_present_bridges_only() {
        // Arrange
        let mut source = MockDeviceSource::new();
        source.expect_enumerate().times(1).returning(|| {
            Ok(vec![
                bridge("/dev/ttyACM1"),
                DeviceCandidate::usb("/dev/ttyACM0", 0x2341, 0x0043),
                bridge("/dev/ttyACM0x"),
            ])
        });
        let mut monitor = monitor_with(source);

        // Act
        let events = monitor.poll().unwrap();

        // Assert
        let paths: Vec<&str> = events.iter().map(DeviceEvent::path).collect();
        assert_eq!(paths, vec!["/dev/ttyACM0x", "/dev/ttyACM1"]);
        assert!(!monitor.contains("/dev/ttyACM0"));
    }

    #[test]
    fn test_repeated_poll_does_not_duplicate_arrivals() {
        let mut source = MockDeviceSource::new();
        source
            .expect_enumerate()
            .times(2)
            .returning(|| Ok(vec![bridge("/dev/ttyACM0")]));
        let mut monitor = monitor_with(source);

        assert_eq!(monitor.poll().unwrap().len(), 1);
        assert!(monitor.poll().unwrap().is_empty());
        assert_eq!(monitor.devices().len(), 1);
    }

    #[test]
    fn test_poll_reports_departure_when_path_disappears() {
        // Arrange
        let mut seq = Sequence::new();
        let mut source = MockDeviceSource::new();
        source
            .expect_enumerate()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(vec![bridge("/dev/ttyACM0")]));
        source
            .expect_enumerate()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(Vec::new()));
        let mut monitor = monitor_with(source);
        monitor.poll().unwrap();

        // Act
        let events = monitor.poll().unwrap();

        // Assert
        assert_eq!(
            events,
            vec![DeviceEvent::Departed {
                path: "/dev/ttyACM0".to_string()
            }]
        );
        assert!(monitor.get("/dev/ttyACM0").is_none());
    }

    #[test]
    fn test_poll_error_leaves_table_untouched() {
        let mut seq = Sequence::new();
        let mut source = MockDeviceSource::new();
        source
            .expect_enumerate()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(vec![bridge("/dev/ttyACM0")]));
        source
            .expect_enumerate()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Err(MonitorError::Enumerate("sysfs unavailable".to_string())));
        let mut monitor = monitor_with(source);
        monitor.poll().unwrap();

        assert!(monitor.poll().is_err());
        assert!(monitor.contains("/dev/ttyACM0"));
    }

    #[test]
    fn test_vendor_only_match_is_accepted_unless_strict() {
        let candidate = DeviceCandidate::usb("/dev/ttyACM0", ESPRESSIF_VENDOR_ID, 0x4001);

        let mut lenient_source = MockDeviceSource::new();
        let c = candidate.clone();
        lenient_source
            .expect_enumerate()
            .returning(move || Ok(vec![c.clone()]));
        let mut lenient = monitor_with(lenient_source);
        assert_eq!(lenient.poll().unwrap().len(), 1);

        let mut strict_source = MockDeviceSource::new();
        strict_source
            .expect_enumerate()
            .returning(move || Ok(vec![candidate.clone()]));
        let mut strict = DeviceMonitor::new(Box::new(strict_source), DeviceSignature::default(), true);
        assert!(strict.poll().unwrap().is_empty());
    }

    #[test]
    fn test_missing_vendor_id_is_rejected() {
        let mut source = MockDeviceSource::new();
        source.expect_enumerate().returning(|| {
            Ok(vec![DeviceCandidate {
                path: "/dev/ttyACM0".to_string(),
                vendor_id: None,
                product_id: None,
                plug_id: None,
            }])
        });
        let mut monitor = monitor_with(source);
        assert!(monitor.poll().unwrap().is_empty());
    }

    #[test]
    fn test_replug_between_polls_reports_departure_then_arrival() {
        // Arrange
        let mut seq = Sequence::new();
        let mut source = MockDeviceSource::new();
        source
            .expect_enumerate()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(vec![bridge("/dev/ttyACM0").with_plug_id("1-4")]));
        source
            .expect_enumerate()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(vec![bridge("/dev/ttyACM0").with_plug_id("1-5")]));
        let mut monitor = monitor_with(source);
        monitor.poll().unwrap();
        monitor.record_serial("/dev/ttyACM0", "BR1234");

        // Act
        let events = monitor.poll().unwrap();

        // Assert
        assert_eq!(
            events,
            vec![
                DeviceEvent::Departed {
                    path: "/dev/ttyACM0".to_string()
                },
                DeviceEvent::Arrived {
                    path: "/dev/ttyACM0".to_string(),
                    vendor_id: ESPRESSIF_VENDOR_ID,
                    product_id: BRIDGE_PRODUCT_ID,
                },
            ]
        );
        assert_eq!(monitor.get("/dev/ttyACM0").unwrap().serial_number, None);
    }

    #[test]
    fn test_unchanged_plug_id_is_not_a_replug() {
        let mut source = MockDeviceSource::new();
        source
            .expect_enumerate()
            .times(2)
            .returning(|| Ok(vec![bridge("/dev/ttyACM0").with_plug_id("1-4")]));
        let mut monitor = monitor_with(source);

        assert_eq!(monitor.poll().unwrap().len(), 1);
        assert!(monitor.poll().unwrap().is_empty());
    }

    // ── apply ─────────────────────────────────────────────────────────────────

    #[test]
    fn test_apply_unknown_departure_is_ignored() {
        let mut monitor = monitor_with(MockDeviceSource::new());
        let result = monitor.apply(DeviceEvent::Departed {
            path: "/dev/ttyUSB3".to_string(),
        });
        assert_eq!(result, None);
    }

    #[test]
    fn test_apply_duplicate_arrival_is_ignored() {
        // Arrange
        let mut monitor = monitor_with(MockDeviceSource::new());
        let arrived = DeviceEvent::Arrived {
            path: "/dev/ttyACM0".to_string(),
            vendor_id: ESPRESSIF_VENDOR_ID,
            product_id: BRIDGE_PRODUCT_ID,
        };

        // Act
        let first = monitor.apply(arrived.clone());
        let second = monitor.apply(arrived.clone());

        // Assert
        assert_eq!(first, Some(arrived));
        assert_eq!(second, None);
    }

    #[test]
    fn test_apply_non_bridge_arrival_is_ignored() {
        let mut monitor = monitor_with(MockDeviceSource::new());
        let result = monitor.apply(DeviceEvent::Arrived {
            path: "/dev/ttyUSB0".to_string(),
            vendor_id: 0x0403,
            product_id: 0x6001,
        });
        assert_eq!(result, None);
        assert!(monitor.devices().is_empty());
    }

    #[test]
    fn test_record_serial_only_updates_present_paths() {
        // Arrange
        let mut monitor = monitor_with(MockDeviceSource::new());
        monitor.apply(DeviceEvent::Arrived {
            path: "/dev/ttyACM0".to_string(),
            vendor_id: ESPRESSIF_VENDOR_ID,
            product_id: BRIDGE_PRODUCT_ID,
        });

        // Act
        let updated = monitor.record_serial("/dev/ttyACM0", "BR1234");
        let missing = monitor.record_serial("/dev/ttyACM1", "BR9999");

        // Assert
        assert!(updated);
        assert!(!missing);
        assert_eq!(
            monitor.get("/dev/ttyACM0").and_then(|r| r.serial_number.as_deref()),
            Some("BR1234")
        );
    }

    #[test]
    fn test_departure_forgets_serial_so_rearrival_starts_fresh() {
        let mut monitor = monitor_with(MockDeviceSource::new());
        let arrived = DeviceEvent::Arrived {
            path: "/dev/ttyACM0".to_string(),
            vendor_id: ESPRESSIF_VENDOR_ID,
            product_id: BRIDGE_PRODUCT_ID,
        };
        monitor.apply(arrived.clone());
        monitor.record_serial("/dev/ttyACM0", "BR1234");
        monitor.apply(DeviceEvent::Departed {
            path: "/dev/ttyACM0".to_string(),
        });
        monitor.apply(arrived);
        assert_eq!(monitor.get("/dev/ttyACM0").unwrap().serial_number, None);
    }
}
