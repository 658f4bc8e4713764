//! Production [`DeviceIdentifier`]: a short serial conversation per device.
//!
//! open → handshake → serial query → name query → close.  The port is always
//! released before the outcome is reported, so a later connect (or another
//! program) can open it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{LinkOpener, TransportClient, TransportError};
use crate::application::identify::{DeviceIdentifier, DeviceIdentity, IdentifyOutcome};

pub struct SerialIdentifier {
    opener: Arc<dyn LinkOpener>,
    timeout: Duration,
}

impl SerialIdentifier {
    pub fn new(opener: Arc<dyn LinkOpener>, timeout: Duration) -> Self {
        Self { opener, timeout }
    }

    /// Runs the whole conversation on the calling thread.
    pub fn identify_blocking(&self, path: &str) -> IdentifyOutcome {
        identify_with(Arc::clone(&self.opener), path, self.timeout)
    }
}

#[async_trait]
impl DeviceIdentifier for SerialIdentifier {
    async fn identify(&self, path: &str) -> IdentifyOutcome {
        let opener = Arc::clone(&self.opener);
        let owned = path.to_string();
        let timeout = self.timeout;
        match tokio::task::spawn_blocking(move || identify_with(opener, &owned, timeout)).await {
            Ok(outcome) => outcome,
            Err(e) => IdentifyOutcome::Failed(format!("identification task failed: {e}")),
        }
    }
}

fn identify_with(opener: Arc<dyn LinkOpener>, path: &str, timeout: Duration) -> IdentifyOutcome {
    let mut client = TransportClient::new(opener, path, timeout);
    let result = converse(&mut client);
    client.close();

    match result {
        Ok(identity) => {
            info!(path = %path, serial = %identity.serial, "bridge identified");
            IdentifyOutcome::Identified(identity)
        }
        Err(TransportError::DeviceBusy { .. }) => {
            debug!(path = %path, "port busy; identification deferred");
            IdentifyOutcome::Busy
        }
        Err(e @ TransportError::Timeout { .. }) => {
            warn!(path = %path, error = %e, "bridge did not answer");
            IdentifyOutcome::TimedOut
        }
        Err(e) => {
            warn!(path = %path, error = %e, "identification failed");
            IdentifyOutcome::Failed(e.to_string())
        }
    }
}

fn converse(client: &mut TransportClient) -> Result<DeviceIdentity, TransportError> {
    client.open()?;
    client.handshake()?;
    let serial = client.fetch_serial_number()?;

    // A missing name is not fatal; fall back to whatever the handshake carried.
    let fetched = match client.fetch_device_name() {
        Ok(name) => Some(name),
        Err(e) => {
            debug!(path = %client.path(), error = %e, "no device name; keeping handshake value");
            None
        }
    };
    let config = client.device_config().cloned();
    let device_name = fetched
        .or_else(|| config.as_ref().map(|c| c.device_name.clone()))
        .filter(|n| !n.is_empty());

    Ok(DeviceIdentity {
        serial,
        device_name,
        config,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
