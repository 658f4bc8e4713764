//! Emulated bridge firmware for testing.
//!
//! [`EmulatedOpener`] stands in for the serial port layer: tests attach an
//! [`EmulatedBridge`] to a path, then flip its fields (busy, silent, serial …)
//! to script the scenario.  Links opened through it decode every frame the
//! host writes and queue the response the firmware would send.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bridge_core::protocol::{
    decode_frame, encode_frame, CommandCode, FirmwareConfig, Frame, FrameError, HidEventPacket,
};

use super::{LinkOpener, SerialLink, TransportError};

/// Scripted behaviour of one emulated device.
#[derive(Debug, Clone, Default)]
pub struct EmulatedBridge {
    pub serial: String,
    pub name: String,
    /// Sent as the handshake payload; `None` sends a bare ACK.
    pub config: Option<FirmwareConfig>,
    /// Overrides the handshake payload with raw bytes.
    pub raw_handshake_payload: Option<Vec<u8>>,
    /// Opening fails with `DeviceBusy`.
    pub busy: bool,
    /// Opening fails with `DeviceUnavailable`.
    pub unavailable: bool,
    /// The device never answers.
    pub silent: bool,
    /// Answers to `NameQuery` only; other commands behave normally.
    pub silent_on_name: bool,
    pub supports_config_query: bool,
    /// Bytes emitted before every response.
    pub unsolicited: Vec<u8>,
    /// Event frames received from the host.
    pub received_events: Vec<HidEventPacket>,
    pub open_attempts: u32,
}

impl EmulatedBridge {
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            name: "Bridge".to_string(),
            supports_config_query: true,
            ..Self::default()
        }
    }

    fn respond(&mut self, frame: &Frame) -> Vec<u8> {
        if let Ok(packet) = HidEventPacket::from_frame(frame) {
            self.received_events.push(packet);
            return Vec::new();
        }
        if self.silent {
            return Vec::new();
        }

        let reply = match CommandCode::try_from(frame.frame_type) {
            Ok(CommandCode::Handshake) => {
                let payload = match (&self.raw_handshake_payload, &self.config) {
                    (Some(raw), _) => raw.clone(),
                    (None, Some(cfg)) => cfg.encode().unwrap_or_default(),
                    (None, None) => Vec::new(),
                };
                Frame::new(CommandCode::HandshakeAck as u8, payload)
            }
            Ok(CommandCode::SerialQuery) => {
                Frame::new(CommandCode::SerialResponse as u8, self.serial.as_bytes())
            }
            Ok(CommandCode::NameQuery) if self.silent_on_name => return Vec::new(),
            Ok(CommandCode::NameQuery) => {
                Frame::new(CommandCode::NameResponse as u8, self.name.as_bytes())
            }
            Ok(CommandCode::ConfigQuery) if self.supports_config_query => {
                let cfg = self.config.clone().unwrap_or_default();
                Frame::new(
                    CommandCode::ConfigResponse as u8,
                    cfg.encode().unwrap_or_default(),
                )
            }
            _ => Frame::new(CommandCode::Nack as u8, vec![frame.frame_type]),
        };

        let mut out = self.unsolicited.clone();
        out.extend(encode_frame(reply.frame_type, &reply.payload).unwrap_or_default());
        out
    }
}

type Devices = Arc<Mutex<HashMap<String, EmulatedBridge>>>;

/// [`LinkOpener`] backed by in-memory emulated devices.
#[derive(Clone, Default)]
pub struct EmulatedOpener {
    devices: Devices,
}

impl EmulatedOpener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plugs an emulated device in at `path`.
    pub fn attach(&self, path: &str, bridge: EmulatedBridge) {
        self.devices
            .lock()
            .expect("lock poisoned")
            .insert(path.to_string(), bridge);
    }

    /// Unplugs the device at `path`; open links start failing.
    pub fn detach(&self, path: &str) {
        self.devices.lock().expect("lock poisoned").remove(path);
    }

    /// Runs `f` against the device at `path`.
    ///
    /// Panics if nothing is attached there.
    pub fn with_bridge<R>(&self, path: &str, f: impl FnOnce(&mut EmulatedBridge) -> R) -> R {
        let mut devices = self.devices.lock().expect("lock poisoned");
        let bridge = devices
            .get_mut(path)
            .unwrap_or_else(|| panic!("no emulated bridge at {path}"));
        f(bridge)
    }
}

impl LinkOpener for EmulatedOpener {
    fn open(&self, path: &str) -> Result<Box<dyn SerialLink>, TransportError> {
        let mut devices = self.devices.lock().expect("lock poisoned");
        let Some(bridge) = devices.get_mut(path) else {
            return Err(TransportError::DeviceUnavailable {
                path: path.to_string(),
                reason: "no such device".to_string(),
            });
        };
        bridge.open_attempts += 1;
        if bridge.busy {
            return Err(TransportError::DeviceBusy {
                path: path.to_string(),
            });
        }
        if bridge.unavailable {
            return Err(TransportError::DeviceUnavailable {
                path: path.to_string(),
                reason: "permission denied".to_string(),
            });
        }
        Ok(Box::new(EmulatedLink {
            path: path.to_string(),
            devices: Arc::clone(&self.devices),
            inbox: Vec::new(),
            outbox: VecDeque::new(),
        }))
    }
}

struct EmulatedLink {
    path: String,
    devices: Devices,
    inbox: Vec<u8>,
    outbox: VecDeque<u8>,
}

impl Write for EmulatedLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inbox.extend_from_slice(buf);
        let mut devices = self.devices.lock().expect("lock poisoned");
        let bridge = devices
            .get_mut(&self.path)
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "device detached"))?;

        loop {
            match decode_frame(&self.inbox) {
                Ok((frame, consumed)) => {
                    self.inbox.drain(..consumed);
                    self.outbox.extend(bridge.respond(&frame));
                }
                Err(FrameError::Truncated { .. }) => break,
                Err(_) => {
                    self.inbox.clear();
                    break;
                }
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for EmulatedLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.outbox.is_empty() {
            // Mimic a serial read timeout slice.
            std::thread::sleep(Duration::from_millis(1));
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(self.outbox.len());
        for (slot, byte) in buf.iter_mut().zip(self.outbox.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}
