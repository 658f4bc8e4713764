//! Serial control-channel client for a single bridge.
//!
//! [`TransportClient`] owns one serial path.  It opens the port exclusively,
//! sends one command frame per request and waits for the matching response
//! frame, with an explicit deadline on every request.
//!
//! # Blocking I/O (for beginners)
//!
//! Serial I/O here is synchronous: a request blocks the calling thread until a
//! response arrives or the timeout elapses.  The async arbiter never calls
//! these methods directly.  It runs identification inside
//! `tokio::task::spawn_blocking`, so a slow device only ties up one worker
//! thread from Tokio's blocking pool, never the event loop.
//!
//! # Error taxonomy
//!
//! The three failure families the arbiter cares about are kept apart:
//!
//! - **absent**: [`TransportError::DeviceUnavailable`] (path gone, permissions).
//! - **busy**: [`TransportError::DeviceBusy`] (another process holds the port).
//! - **present but wrong**: [`TransportError::Timeout`],
//!   [`TransportError::ProtocolMismatch`], and frame errors.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bridge_core::protocol::{
    decode_frame, CommandCode, FirmwareConfig, Frame, FrameError, HidEventError, HidEventPacket,
};
use thiserror::Error;
use tracing::{debug, trace, warn};

pub mod identifier;
pub mod mock;
pub mod serial;

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Size of a single read from the link.
const READ_CHUNK: usize = 256;

/// Errors produced by [`TransportClient`] and [`LinkOpener`].
#[derive(Debug, Error)]
pub enum TransportError {
    /// Another process holds the port.  Expected; retry later.
    #[error("device {path} is busy (held by another process)")]
    DeviceBusy { path: String },

    /// The port could not be opened for any other reason.
    #[error("device {path} unavailable: {reason}")]
    DeviceUnavailable { path: String, reason: String },

    /// No well-formed response of the expected type arrived in time.
    #[error("timed out after {timeout_ms} ms waiting for {command:?} response")]
    Timeout { command: CommandCode, timeout_ms: u64 },

    /// A malformed frame was received; the receive buffer was discarded.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// The device answered with an empty serial number.
    #[error("device reported no serial number")]
    NotAvailable,

    /// The device does not implement the command.
    #[error("device does not support {0:?}")]
    Unsupported(CommandCode),

    /// The device answered but its payload is not what this host speaks.
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// Operation attempted on a closed client.
    #[error("transport is not open")]
    NotOpen,

    /// The link failed mid-transfer.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl From<HidEventError> for TransportError {
    fn from(e: HidEventError) -> Self {
        match e {
            HidEventError::Frame(f) => TransportError::Frame(f),
            other => TransportError::ProtocolMismatch(other.to_string()),
        }
    }
}

// ── Link abstraction ──────────────────────────────────────────────────────────

/// A byte stream to one device.
///
/// Reads are expected to return within a short slice of time: either some
/// bytes, `Ok(0)`, or an error of kind `TimedOut` / `WouldBlock` when nothing
/// arrived.  `Box<dyn serialport::SerialPort>` satisfies this.
pub trait SerialLink: Read + Write + Send {}

impl<T: Read + Write + Send + ?Sized> SerialLink for T {}

/// Opens exclusive links to device paths.
pub trait LinkOpener: Send + Sync {
    /// # Errors
    ///
    /// [`TransportError::DeviceBusy`] when another owner holds the path,
    /// [`TransportError::DeviceUnavailable`] for any other failure.
    fn open(&self, path: &str) -> Result<Box<dyn SerialLink>, TransportError>;
}

// ── Handshake result ──────────────────────────────────────────────────────────

/// Outcome of a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeAck {
    /// `None` for older firmware that acknowledges without a payload.
    pub config: Option<FirmwareConfig>,
}

// ── Client ────────────────────────────────────────────────────────────────────

/// Request/response client for one serial path.
///
/// State is `Closed → Open → Closed`; [`TransportClient::close`] is idempotent.
pub struct TransportClient {
    opener: Arc<dyn LinkOpener>,
    path: String,
    timeout: Duration,
    link: Option<Box<dyn SerialLink>>,
    rx: Vec<u8>,
    config: Option<FirmwareConfig>,
}

impl TransportClient {
    pub fn new(opener: Arc<dyn LinkOpener>, path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            opener,
            path: path.into(),
            timeout,
            link: None,
            rx: Vec::new(),
            config: None,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.link.is_some()
    }

    /// Configuration from the last handshake, with the name updated by any
    /// later successful [`TransportClient::fetch_device_name`].
    pub fn device_config(&self) -> Option<&FirmwareConfig> {
        self.config.as_ref()
    }

    /// Acquires the path exclusively.  Opening an open client is a no-op.
    ///
    /// # Errors
    ///
    /// See [`LinkOpener::open`].
    pub fn open(&mut self) -> Result<(), TransportError> {
        if self.link.is_some() {
            return Ok(());
        }
        let link = self.opener.open(&self.path)?;
        debug!(path = %self.path, "serial link opened");
        self.link = Some(link);
        self.rx.clear();
        Ok(())
    }

    /// Releases the path.  Safe to call any number of times.
    pub fn close(&mut self) {
        if self.link.take().is_some() {
            debug!(path = %self.path, "serial link closed");
        }
        self.rx.clear();
    }

    /// Performs the handshake and caches the returned configuration.
    ///
    /// # Errors
    ///
    /// [`TransportError::Timeout`] if the device stays silent,
    /// [`TransportError::ProtocolMismatch`] if the ACK payload is not a
    /// configuration this host understands.
    pub fn handshake(&mut self) -> Result<HandshakeAck, TransportError> {
        let payload = self.request(CommandCode::Handshake)?;
        let config = if payload.is_empty() {
            debug!(path = %self.path, "bare handshake ACK (older firmware)");
            None
        } else {
            let cfg = FirmwareConfig::decode(&payload)
                .map_err(|e| TransportError::ProtocolMismatch(e.to_string()))?;
            debug!(
                path = %self.path,
                protocol = cfg.protocol_version,
                hid_connected = cfg.hid_connected,
                host_os = cfg.host_os_string(),
                ble_interval_ms = cfg.ble_interval_ms,
                activated = cfg.production_activated,
                firmware = %cfg.firmware_version(),
                hardware = %cfg.hardware_version(),
                "handshake config"
            );
            Some(cfg)
        };
        self.config = config.clone();
        Ok(HandshakeAck { config })
    }

    /// # Errors
    ///
    /// [`TransportError::NotAvailable`] when the device reports an empty serial.
    pub fn fetch_serial_number(&mut self) -> Result<String, TransportError> {
        let payload = self.request(CommandCode::SerialQuery)?;
        let serial = decode_text(&payload)?.trim().to_string();
        if serial.is_empty() {
            return Err(TransportError::NotAvailable);
        }
        Ok(serial)
    }

    /// Fetches the display name.  Callers treat failure as non-fatal and keep
    /// the previously known name.
    ///
    /// # Errors
    ///
    /// Any request error; the cached configuration is left unchanged.
    pub fn fetch_device_name(&mut self) -> Result<String, TransportError> {
        let payload = self.request(CommandCode::NameQuery)?;
        let name = decode_text(&payload)?.trim().to_string();
        if let Some(cfg) = self.config.as_mut() {
            cfg.device_name = name.clone();
        }
        Ok(name)
    }

    /// # Errors
    ///
    /// [`TransportError::Unsupported`] when the device NACKs the query.
    pub fn fetch_config(&mut self) -> Result<FirmwareConfig, TransportError> {
        let payload = self.request(CommandCode::ConfigQuery)?;
        FirmwareConfig::decode(&payload).map_err(|e| TransportError::ProtocolMismatch(e.to_string()))
    }

    /// Writes one HID event frame; no response is expected.
    ///
    /// # Errors
    ///
    /// [`TransportError::NotOpen`] or a write failure.
    pub fn send_event(&mut self, packet: &HidEventPacket) -> Result<(), TransportError> {
        let bytes = packet.serialize()?;
        self.write_bytes(&bytes)
    }

    // ── Request plumbing ──────────────────────────────────────────────────────

    fn request(&mut self, command: CommandCode) -> Result<Vec<u8>, TransportError> {
        if self.link.is_none() {
            return Err(TransportError::NotOpen);
        }
        let expected = command
            .expected_response()
            .ok_or(TransportError::Unsupported(command))?;
        let bytes = command.request_frame().encode()?;
        self.write_bytes(&bytes)?;
        self.await_response(command, expected)
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let path = self.path.clone();
        let link = self.link.as_mut().ok_or(TransportError::NotOpen)?;
        trace!(path = %path, ?bytes, "tx");
        link.write_all(bytes)
            .and_then(|_| link.flush())
            .map_err(|source| TransportError::Io { path, source })
    }

    /// Reads until a frame of type `expected` arrives or the deadline passes.
    fn await_response(
        &mut self,
        command: CommandCode,
        expected: CommandCode,
    ) -> Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + self.timeout;
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            while let Some(frame) = self.next_buffered_frame()? {
                if frame.frame_type == expected as u8 {
                    return Ok(frame.payload);
                }
                if frame.frame_type == CommandCode::Nack as u8
                    && frame.payload.first() == Some(&(command as u8))
                {
                    return Err(TransportError::Unsupported(command));
                }
                debug!(
                    path = %self.path,
                    frame_type = frame.frame_type,
                    "skipping unexpected frame"
                );
            }

            if Instant::now() >= deadline {
                if !self.rx.is_empty() {
                    let available = self.rx.len();
                    self.rx.clear();
                    warn!(path = %self.path, available, "partial frame at deadline");
                    return Err(TransportError::Frame(FrameError::Truncated {
                        needed: available + 1,
                        available,
                    }));
                }
                return Err(TransportError::Timeout {
                    command,
                    timeout_ms: self.timeout.as_millis() as u64,
                });
            }

            let link = self.link.as_mut().ok_or(TransportError::NotOpen)?;
            match link.read(&mut chunk) {
                Ok(0) => std::thread::yield_now(),
                Ok(n) => {
                    trace!(path = %self.path, bytes = ?&chunk[..n], "rx");
                    self.rx.extend_from_slice(&chunk[..n]);
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) =>
                {
                    std::thread::yield_now();
                }
                Err(source) => {
                    self.rx.clear();
                    return Err(TransportError::Io {
                        path: self.path.clone(),
                        source,
                    });
                }
            }
        }
    }

    /// Pops one complete frame off the receive buffer.
    ///
    /// A malformed buffer is discarded so the next request starts clean.
    fn next_buffered_frame(&mut self) -> Result<Option<Frame>, TransportError> {
        match decode_frame(&self.rx) {
            Ok((frame, consumed)) => {
                self.rx.drain(..consumed);
                Ok(Some(frame))
            }
            Err(FrameError::Truncated { .. }) => Ok(None),
            Err(e) => {
                warn!(path = %self.path, error = %e, "discarding malformed receive buffer");
                self.rx.clear();
                Err(TransportError::Frame(e))
            }
        }
    }
}

impl Drop for TransportClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn decode_text(payload: &[u8]) -> Result<&str, TransportError> {
    std::str::from_utf8(payload)
        .map_err(|e| TransportError::ProtocolMismatch(format!("response is not UTF-8: {e}")))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
