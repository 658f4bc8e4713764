//! [`LinkOpener`] backed by the `serialport` crate.
//!
//! On Unix the port is opened with `TIOCEXCL`, so a second opener gets
//! `EBUSY`.  On Windows a COM port can only have one handle; a second open
//! fails with "Access is denied".  Both are mapped to
//! [`TransportError::DeviceBusy`].

use std::time::Duration;

use tracing::debug;

use super::{LinkOpener, SerialLink, TransportError};

/// Default line speed.  CDC-ACM ignores it, but the OS API requires one.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Upper bound on a single blocking read; the client loops until its deadline.
const READ_SLICE: Duration = Duration::from_millis(20);

/// Opens real serial ports.
#[derive(Debug, Clone)]
pub struct SerialPortOpener {
    baud_rate: u32,
}

impl SerialPortOpener {
    pub fn new(baud_rate: u32) -> Self {
        Self { baud_rate }
    }
}

impl Default for SerialPortOpener {
    fn default() -> Self {
        Self::new(DEFAULT_BAUD_RATE)
    }
}

impl LinkOpener for SerialPortOpener {
    fn open(&self, path: &str) -> Result<Box<dyn SerialLink>, TransportError> {
        let port = serialport::new(path, self.baud_rate)
            .timeout(READ_SLICE)
            .open()
            .map_err(|e| classify_open_error(path, &e))?;
        debug!(path, baud = self.baud_rate, "serial port opened");
        Ok(Box::new(port))
    }
}

/// Maps an open failure onto busy vs. unavailable.
fn classify_open_error(path: &str, err: &serialport::Error) -> TransportError {
    let description = err.description.to_lowercase();
    let busy = description.contains("busy")
        || (cfg!(target_os = "windows") && description.contains("access is denied"));
    if busy {
        TransportError::DeviceBusy {
            path: path.to_string(),
        }
    } else {
        TransportError::DeviceUnavailable {
            path: path.to_string(),
            reason: err.description.clone(),
        }
    }
}
