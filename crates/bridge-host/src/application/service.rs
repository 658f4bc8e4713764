//! The arbiter's processing task and the handle other code uses to reach it.
//!
//! # One task, one queue (for beginners)
//!
//! [`ArbiterService::run`] is the only code that touches the device table,
//! the arbiter, and the claim table.  Everything else talks to it through an
//! [`ArbiterHandle`]: each request is a message on an `mpsc` channel carrying
//! a `oneshot` sender for the reply.  The task handles one message at a time,
//! so two "connect" requests can never interleave and the single-owner rule
//! needs no locks.
//!
//! ```text
//!  ArbiterHandle ──mpsc──►┐
//!  identification ──mpsc─►├─ select! ─► ConnectionArbiter ─► broadcast<ArbiterEvent>
//!  poll interval ────────►┘
//! ```
//!
//! Identification talks to the device and may take up to the transport
//! timeout, so it runs in a spawned task.  Its result comes back through the
//! same `select!` loop tagged with the generation it was started for.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bridge_core::{ProfileId, UsbDeviceRecord};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::arbiter::{
    ArbiterError, ArbiterEvent, ConnectionArbiter, DeviceView, IdentifyRequest,
};
use super::claims::ConnectionClaim;
use super::identify::{DeviceIdentifier, IdentifyOutcome};
use crate::infrastructure::device_monitor::{DeviceEvent, DeviceMonitor};

/// Capacity of the command channel.
const COMMAND_CAPACITY: usize = 64;

/// Capacity of the event broadcast; slow subscribers lag rather than block.
const EVENT_CAPACITY: usize = 256;

/// Point-in-time view for observers and `--once`.
#[derive(Debug, Clone, Serialize)]
pub struct ArbiterSnapshot {
    /// Present bridges as the monitor sees them.
    pub present: Vec<UsbDeviceRecord>,
    pub devices: Vec<DeviceView>,
    pub claims: Vec<ConnectionClaim>,
}

/// Requests accepted by the service task.
#[derive(Debug)]
pub enum ArbiterCommand {
    Connect {
        path: String,
        profile: Option<ProfileId>,
        reply: oneshot::Sender<Result<ConnectionClaim, ArbiterError>>,
    },
    Disconnect {
        path: String,
        reply: oneshot::Sender<Result<(), ArbiterError>>,
    },
    Delete {
        record: PathBuf,
        reply: oneshot::Sender<Result<(), ArbiterError>>,
    },
    /// Re-enumerate and re-identify every unidentified device.  Replies with
    /// the number of identifications started.
    Refresh { reply: oneshot::Sender<usize> },
    Snapshot {
        reply: oneshot::Sender<ArbiterSnapshot>,
    },
    /// Feed a presence notification from outside the poll loop.  Replies
    /// whether it changed the device table.
    Device {
        event: DeviceEvent,
        reply: oneshot::Sender<bool>,
    },
    Shutdown,
}

#[derive(Debug)]
struct IdentifyResult {
    path: String,
    generation: u64,
    outcome: IdentifyOutcome,
}

// ── Handle ────────────────────────────────────────────────────────────────────

/// Cheap to clone; every clone talks to the same service task.
#[derive(Clone)]
pub struct ArbiterHandle {
    commands: mpsc::Sender<ArbiterCommand>,
    events: broadcast::Sender<ArbiterEvent>,
}

impl ArbiterHandle {
    /// Receives every [`ArbiterEvent`] emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ArbiterEvent> {
        self.events.subscribe()
    }

    /// # Errors
    ///
    /// See [`ConnectionArbiter::connect`]; [`ArbiterError::ServiceStopped`] if
    /// the task is gone.
    pub async fn connect(
        &self,
        path: &str,
        profile: Option<ProfileId>,
    ) -> Result<ConnectionClaim, ArbiterError> {
        let path = path.to_string();
        self.call(|reply| ArbiterCommand::Connect {
            path,
            profile,
            reply,
        })
        .await?
    }

    /// # Errors
    ///
    /// See [`ConnectionArbiter::disconnect`].
    pub async fn disconnect(&self, path: &str) -> Result<(), ArbiterError> {
        let path = path.to_string();
        self.call(|reply| ArbiterCommand::Disconnect { path, reply })
            .await?
    }

    /// Deletes a profile record.
    ///
    /// # Errors
    ///
    /// See [`ConnectionArbiter::delete_profile`].
    pub async fn delete(&self, record: impl Into<PathBuf>) -> Result<(), ArbiterError> {
        let record = record.into();
        self.call(|reply| ArbiterCommand::Delete { record, reply })
            .await?
    }

    /// # Errors
    ///
    /// [`ArbiterError::ServiceStopped`] if the task is gone.
    pub async fn refresh(&self) -> Result<usize, ArbiterError> {
        self.call(|reply| ArbiterCommand::Refresh { reply }).await
    }

    /// # Errors
    ///
    /// [`ArbiterError::ServiceStopped`] if the task is gone.
    pub async fn snapshot(&self) -> Result<ArbiterSnapshot, ArbiterError> {
        self.call(|reply| ArbiterCommand::Snapshot { reply }).await
    }

    /// # Errors
    ///
    /// [`ArbiterError::ServiceStopped`] if the task is gone.
    pub async fn device_event(&self, event: DeviceEvent) -> Result<bool, ArbiterError> {
        self.call(|reply| ArbiterCommand::Device { event, reply })
            .await
    }

    /// Asks the task to stop.  Idempotent.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(ArbiterCommand::Shutdown).await;
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> ArbiterCommand,
    ) -> Result<T, ArbiterError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| ArbiterError::ServiceStopped)?;
        rx.await.map_err(|_| ArbiterError::ServiceStopped)
    }
}

// ── Service ───────────────────────────────────────────────────────────────────

pub struct ArbiterService {
    arbiter: ConnectionArbiter,
    monitor: DeviceMonitor,
    identifier: Arc<dyn DeviceIdentifier>,
    poll_interval: Duration,
    commands: mpsc::Receiver<ArbiterCommand>,
    results_tx: mpsc::UnboundedSender<IdentifyResult>,
    results_rx: mpsc::UnboundedReceiver<IdentifyResult>,
    events: broadcast::Sender<ArbiterEvent>,
}

impl ArbiterService {
    pub fn new(
        arbiter: ConnectionArbiter,
        monitor: DeviceMonitor,
        identifier: Arc<dyn DeviceIdentifier>,
        poll_interval: Duration,
    ) -> (Self, ArbiterHandle) {
        let (commands_tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let handle = ArbiterHandle {
            commands: commands_tx,
            events: events.clone(),
        };
        let service = Self {
            arbiter,
            monitor,
            identifier,
            poll_interval,
            commands,
            results_tx,
            results_rx,
            events,
        };
        (service, handle)
    }

    /// Processes commands, identification results, and poll ticks until
    /// [`ArbiterHandle::shutdown`] or until every handle is dropped.
    ///
    /// The first tick fires immediately, so the initial enumeration happens
    /// as soon as the task starts.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(poll_ms = self.poll_interval.as_millis() as u64, "arbiter service started");

        loop {
            tokio::select! {
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(ArbiterCommand::Shutdown) | None => break,
                        Some(cmd) => self.handle_command(cmd),
                    }
                }
                Some(result) = self.results_rx.recv() => {
                    self.apply_result(result);
                }
                _ = ticker.tick() => {
                    let mut requests = self.poll_devices();
                    requests.extend(self.arbiter.retry_busy());
                    self.dispatch(requests);
                }
            }
            self.publish();
        }

        info!("arbiter service stopped");
    }

    /// Enumerates once, identifies every bridge found, and returns the
    /// resulting snapshot without starting the loop.
    pub async fn run_once(mut self) -> ArbiterSnapshot {
        for request in self.poll_devices() {
            let outcome = self.identifier.identify(&request.path).await;
            self.apply_result(IdentifyResult {
                path: request.path,
                generation: request.generation,
                outcome,
            });
        }
        self.publish();
        self.snapshot()
    }

    fn handle_command(&mut self, cmd: ArbiterCommand) {
        match cmd {
            ArbiterCommand::Connect {
                path,
                profile,
                reply,
            } => {
                let _ = reply.send(self.arbiter.connect(&path, profile));
            }
            ArbiterCommand::Disconnect { path, reply } => {
                let _ = reply.send(self.arbiter.disconnect(&path));
            }
            ArbiterCommand::Delete { record, reply } => {
                let _ = reply.send(self.arbiter.delete_profile(&record));
            }
            ArbiterCommand::Refresh { reply } => {
                let mut requests = self.poll_devices();
                requests.extend(self.arbiter.refresh());
                let started = requests.len();
                self.dispatch(requests);
                let _ = reply.send(started);
            }
            ArbiterCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            ArbiterCommand::Device { event, reply } => {
                let changed = match self.monitor.apply(event) {
                    Some(applied) => {
                        let request = self.on_device_event(applied);
                        self.dispatch(request.into_iter().collect());
                        true
                    }
                    None => false,
                };
                let _ = reply.send(changed);
            }
            ArbiterCommand::Shutdown => {}
        }
    }

    /// Applies one enumeration pass; returns the identifications to start.
    fn poll_devices(&mut self) -> Vec<IdentifyRequest> {
        match self.monitor.poll() {
            Ok(events) => events
                .into_iter()
                .filter_map(|event| self.on_device_event(event))
                .collect(),
            Err(e) => {
                warn!(error = %e, "device enumeration failed");
                Vec::new()
            }
        }
    }

    fn on_device_event(&mut self, event: DeviceEvent) -> Option<IdentifyRequest> {
        match event {
            DeviceEvent::Arrived { path, .. } => self.arbiter.arrived(&path),
            DeviceEvent::Departed { path } => {
                self.arbiter.departed(&path);
                None
            }
        }
    }

    fn apply_result(&mut self, result: IdentifyResult) {
        if let Some(serial) =
            self.arbiter
                .identification_finished(&result.path, result.generation, result.outcome)
        {
            self.monitor.record_serial(&result.path, &serial);
        }
    }

    fn dispatch(&self, requests: Vec<IdentifyRequest>) {
        for request in requests {
            let identifier = Arc::clone(&self.identifier);
            let results = self.results_tx.clone();
            debug!(path = %request.path, generation = request.generation, "dispatching identification");
            tokio::spawn(async move {
                let outcome = identifier.identify(&request.path).await;
                let _ = results.send(IdentifyResult {
                    path: request.path,
                    generation: request.generation,
                    outcome,
                });
            });
        }
    }

    fn publish(&mut self) {
        for event in self.arbiter.drain_events() {
            debug!(?event, "arbiter event");
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }

    fn snapshot(&self) -> ArbiterSnapshot {
        ArbiterSnapshot {
            present: self.monitor.devices(),
            devices: self.arbiter.views(),
            claims: self.arbiter.claims().all(),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
