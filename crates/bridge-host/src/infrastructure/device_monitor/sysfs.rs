//! Linux enumeration through sysfs.
//!
//! For every `/dev/ttyACM*` node the USB ids are read from
//! `/sys/class/tty/<name>/device`.  That link points at the USB *interface*;
//! `idVendor` and `idProduct` live on the parent USB *device*, so the
//! resolved path is walked upwards a bounded number of levels.
//!
//! The same USB device directory holds `busnum` and `devnum`.  The kernel
//! hands out a new `devnum` on every plug, so `busnum-devnum` serves as the
//! candidate's plug id.

use std::fs;
use std::path::{Path, PathBuf};

use bridge_core::parse_usb_id;
use tracing::trace;

use super::{DeviceCandidate, DeviceSource, MonitorError};

/// How many directories to inspect, starting at the resolved interface.
const MAX_SYSFS_DEPTH: usize = 6;

/// Enumerates CDC-ACM nodes and reads their USB ids from sysfs.
#[derive(Debug, Clone)]
pub struct SysfsSource {
    dev_dir: PathBuf,
    tty_class_dir: PathBuf,
    node_prefix: String,
}

impl Default for SysfsSource {
    fn default() -> Self {
        Self::with_roots("/dev", "/sys/class/tty")
    }
}

impl SysfsSource {
    /// Uses alternative roots for `/dev` and `/sys/class/tty`.
    pub fn with_roots(dev_dir: impl Into<PathBuf>, tty_class_dir: impl Into<PathBuf>) -> Self {
        Self {
            dev_dir: dev_dir.into(),
            tty_class_dir: tty_class_dir.into(),
            node_prefix: "ttyACM".to_string(),
        }
    }

    fn candidate(&self, path: String, node_name: &str) -> DeviceCandidate {
        let mut candidate = DeviceCandidate {
            path,
            vendor_id: None,
            product_id: None,
            plug_id: None,
        };
        let link = self.tty_class_dir.join(node_name).join("device");
        let Ok(mut dir) = fs::canonicalize(&link) else {
            trace!(link = %link.display(), "no sysfs device link");
            return candidate;
        };

        for _ in 0..MAX_SYSFS_DEPTH {
            let vendor = read_id(&dir.join("idVendor"));
            if vendor.is_some() {
                candidate.vendor_id = vendor;
                candidate.product_id = read_id(&dir.join("idProduct"));
                candidate.plug_id = plug_id(&dir);
                return candidate;
            }
            match dir.parent() {
                Some(parent) => dir = parent.to_path_buf(),
                None => break,
            }
        }
        candidate
    }
}

impl DeviceSource for SysfsSource {
    fn enumerate(&self) -> Result<Vec<DeviceCandidate>, MonitorError> {
        let entries = fs::read_dir(&self.dev_dir).map_err(|source| MonitorError::Io {
            path: self.dev_dir.clone(),
            source,
        })?;

        let mut found = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(&self.node_prefix) {
                continue;
            }
            found.push(self.candidate(entry.path().to_string_lossy().into_owned(), name));
        }
        found.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(found)
    }
}

fn read_id(path: &Path) -> Option<u16> {
    fs::read_to_string(path).ok().and_then(|s| parse_usb_id(&s))
}

fn plug_id(usb_dev: &Path) -> Option<String> {
    let read = |name: &str| {
        fs::read_to_string(usb_dev.join(name))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };
    Some(format!("{}-{}", read("busnum")?, read("devnum")?))
}
