//! Enumeration through `serialport::available_ports`.
//!
//! Used on Windows and macOS, where the OS serial APIs already report USB
//! vendor and product ids for each port.  Non-USB ports are listed with no
//! ids so the signature check rejects them.
//!
//! The USB serial-number string, when the OS reports one, is used as the plug
//! id, so a different bridge appearing under the same port name counts as a
//! new arrival.

use serialport::SerialPortType;

use super::{DeviceCandidate, DeviceSource, MonitorError};

/// Lists ports known to the OS serial subsystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialPortSource;

impl DeviceSource for SerialPortSource {
    fn enumerate(&self) -> Result<Vec<DeviceCandidate>, MonitorError> {
        let ports =
            serialport::available_ports().map_err(|e| MonitorError::Enumerate(e.description))?;
        Ok(ports
            .into_iter()
            .map(|info| match info.port_type {
                SerialPortType::UsbPort(usb) => {
                    let candidate = DeviceCandidate::usb(info.port_name, usb.vid, usb.pid);
                    match usb.serial_number {
                        Some(serial) => candidate.with_plug_id(serial),
                        None => candidate,
                    }
                }
                _ => DeviceCandidate {
                    path: info.port_name,
                    vendor_id: None,
                    product_id: None,
                    plug_id: None,
                },
            })
            .collect())
    }
}
