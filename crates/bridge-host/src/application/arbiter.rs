//! Use case: bind identified bridges to profiles and arbitrate who may
//! connect.
//!
//! [`ConnectionArbiter`] keeps one [`DeviceState`] per present device path:
//!
//! ```text
//!  arrived ──► Identifying ──► Bound ──connect──► Connected
//!                  │  ▲          ▲                   │
//!                  ▼  │ refresh  └─────disconnect────┘
//!             Unidentified
//!
//!  departed: any state ──► (removed; claim released)
//! ```
//!
//! # Stale identification results (for beginners)
//!
//! Identification talks to the device and takes a while, so it runs outside
//! the arbiter.  By the time its result comes back the device may have been
//! unplugged, or unplugged and plugged in again.  Every identification attempt
//! therefore gets a fresh *generation* number, stored in the `Identifying`
//! state.  A result is only applied if the path is still `Identifying` with
//! the same generation; anything else is discarded untouched.
//!
//! # Single owner
//!
//! The arbiter is a plain `&mut self` state machine with no locks.  It is
//! owned by exactly one task (`ArbiterService`), which feeds it commands,
//! device events, and identification results one at a time.

use std::collections::HashMap;
use std::path::Path;

use bridge_core::{BridgeProfile, ProfileId};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::claims::{ClaimCheck, ClaimTable, ConnectionClaim};
use super::identify::{IdentifyOutcome, PendingReason};
use crate::infrastructure::storage::StoreError;

// ── Ports ─────────────────────────────────────────────────────────────────────

/// Persistence the arbiter needs.  Implemented by `ConfigStore`.
pub trait ProfileRepository: Send {
    /// Every profile bound to `serial`, ordered by id.
    fn find_by_serial(&self, serial: &str) -> Result<Vec<BridgeProfile>, StoreError>;

    /// Every profile, ordered by id.
    fn list(&self) -> Result<Vec<BridgeProfile>, StoreError>;

    /// Creates the default profile for a serial seen for the first time.
    fn create_for_device(&self, serial: &str, device_path: &str) -> Result<BridgeProfile, StoreError>;

    fn record_device_name(&self, id: &ProfileId, name: &str) -> Result<(), StoreError>;

    /// Deletes a record unless `claims` says its profile is connected.
    fn delete(&self, record: &Path, claims: &dyn ClaimCheck) -> Result<(), StoreError>;
}

// ── Errors and events ─────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ArbiterError {
    #[error("no bridge is present at {0}")]
    UnknownDevice(String),

    #[error("bridge at {0} is not identified yet")]
    NotBound(String),

    #[error("profile {0} is not bound to this bridge")]
    UnknownProfile(ProfileId),

    #[error("no profile is bound to the bridge at {0}")]
    NoProfile(String),

    #[error("bridge is already claimed by profile {blocking}")]
    AlreadyClaimed { blocking: ProfileId },

    #[error("profile {profile} already holds this bridge through {path}")]
    ClaimedThroughOtherPath { profile: ProfileId, path: String },

    #[error("profile store error: {0}")]
    Store(#[from] StoreError),

    #[error("arbiter service is not running")]
    ServiceStopped,
}

/// Notifications for observers (UI, logging, tests).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ArbiterEvent {
    Identified {
        path: String,
        serial: String,
        device_name: Option<String>,
    },
    Bound {
        path: String,
        serial: String,
        profiles: Vec<ProfileId>,
    },
    Connected {
        path: String,
        serial: String,
        profile: ProfileId,
    },
    Disconnected {
        path: String,
        serial: String,
        profile: ProfileId,
    },
    ClaimDenied {
        path: String,
        requested: ProfileId,
        blocking: ProfileId,
    },
    Removed {
        path: String,
    },
    IdentificationPending {
        path: String,
        reason: PendingReason,
    },
}

// ── State ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DeviceState {
    Unidentified { reason: PendingReason },
    Identifying { generation: u64 },
    Bound { serial: String },
    Connected { serial: String, profile: ProfileId },
}

/// Identification the caller must run and report back through
/// [`ConnectionArbiter::identification_finished`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifyRequest {
    pub path: String,
    pub generation: u64,
}

/// One device as seen by observers.  Profiles are re-read from the store.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceView {
    pub path: String,
    #[serde(flatten)]
    pub state: DeviceState,
    pub profiles: Vec<ProfileId>,
}

pub struct ConnectionArbiter {
    profiles: Box<dyn ProfileRepository>,
    claims: ClaimTable,
    devices: HashMap<String, DeviceState>,
    next_generation: u64,
    pending_events: Vec<ArbiterEvent>,
}

impl ConnectionArbiter {
    pub fn new(profiles: Box<dyn ProfileRepository>) -> Self {
        Self {
            profiles,
            claims: ClaimTable::new(),
            devices: HashMap::new(),
            next_generation: 1,
            pending_events: Vec::new(),
        }
    }

    pub fn state(&self, path: &str) -> Option<&DeviceState> {
        self.devices.get(path)
    }

    pub fn claims(&self) -> &ClaimTable {
        &self.claims
    }

    /// Events produced since the last call, oldest first.
    pub fn drain_events(&mut self) -> Vec<ArbiterEvent> {
        std::mem::take(&mut self.pending_events)
    }

    // ── Presence ──────────────────────────────────────────────────────────────

    /// A bridge appeared.  Returns the identification to dispatch, or `None`
    /// if the path is already tracked.
    pub fn arrived(&mut self, path: &str) -> Option<IdentifyRequest> {
        if self.devices.contains_key(path) {
            debug!(path = %path, "arrival for tracked path ignored");
            return None;
        }
        Some(self.begin_identification(path))
    }

    /// A bridge went away: any claim is released and the binding is dropped.
    /// Returns whether the path was tracked.
    pub fn departed(&mut self, path: &str) -> bool {
        let Some(state) = self.devices.remove(path) else {
            return false;
        };
        if let DeviceState::Connected { serial, profile } = state {
            self.claims.release(&serial);
            info!(path = %path, serial = %serial, profile = %profile, "claim released on departure");
            self.pending_events.push(ArbiterEvent::Disconnected {
                path: path.to_string(),
                serial,
                profile,
            });
        }
        self.pending_events.push(ArbiterEvent::Removed {
            path: path.to_string(),
        });
        true
    }

    // ── Identification ────────────────────────────────────────────────────────

    /// Re-identifies every unidentified path, whatever the reason.
    pub fn refresh(&mut self) -> Vec<IdentifyRequest> {
        self.restart_where(|_| true)
    }

    /// Re-identifies only paths whose port was busy.
    pub fn retry_busy(&mut self) -> Vec<IdentifyRequest> {
        self.restart_where(|reason| reason == PendingReason::Busy)
    }

    /// Applies an identification result.  Returns the bound serial when the
    /// path moved to `Bound`; stale results return `None` and change nothing.
    pub fn identification_finished(
        &mut self,
        path: &str,
        generation: u64,
        outcome: IdentifyOutcome,
    ) -> Option<String> {
        match self.devices.get(path) {
            Some(DeviceState::Identifying { generation: current }) if *current == generation => {}
            _ => {
                debug!(path = %path, generation, "discarding stale identification result");
                return None;
            }
        }

        let identity = match outcome {
            IdentifyOutcome::Identified(identity) => identity,
            other => {
                let reason = other.pending_reason().unwrap_or(PendingReason::Failed);
                self.set_pending(path, reason);
                return None;
            }
        };

        self.pending_events.push(ArbiterEvent::Identified {
            path: path.to_string(),
            serial: identity.serial.clone(),
            device_name: identity.device_name.clone(),
        });

        match self.bind(path, &identity.serial, identity.device_name.as_deref()) {
            Ok(profiles) => {
                info!(path = %path, serial = %identity.serial, profiles = profiles.len(), "bridge bound");
                self.devices.insert(
                    path.to_string(),
                    DeviceState::Bound {
                        serial: identity.serial.clone(),
                    },
                );
                self.pending_events.push(ArbiterEvent::Bound {
                    path: path.to_string(),
                    serial: identity.serial.clone(),
                    profiles,
                });
                Some(identity.serial)
            }
            Err(e) => {
                warn!(path = %path, serial = %identity.serial, error = %e, "could not bind bridge to a profile");
                self.set_pending(path, PendingReason::Failed);
                None
            }
        }
    }

    // ── Claims ────────────────────────────────────────────────────────────────

    /// Connects `profile` (or the first profile bound to the device) to the
    /// bridge at `path`.
    ///
    /// # Errors
    ///
    /// [`ArbiterError::AlreadyClaimed`] when another profile holds the serial;
    /// [`ArbiterError::ClaimedThroughOtherPath`] when the same profile already
    /// holds it through a second path carrying that serial;
    /// [`ArbiterError::NotBound`], [`ArbiterError::UnknownDevice`],
    /// [`ArbiterError::UnknownProfile`] for invalid requests.
    pub fn connect(
        &mut self,
        path: &str,
        profile: Option<ProfileId>,
    ) -> Result<ConnectionClaim, ArbiterError> {
        let serial = match self.devices.get(path).cloned() {
            None => return Err(ArbiterError::UnknownDevice(path.to_string())),
            Some(DeviceState::Connected { serial, profile: owner }) => {
                return match profile {
                    Some(requested) if requested != owner => Err(self.deny(path, requested, owner)),
                    _ => self
                        .claims
                        .get(&serial)
                        .cloned()
                        .ok_or_else(|| ArbiterError::NotBound(path.to_string())),
                };
            }
            Some(DeviceState::Bound { serial }) => serial,
            Some(_) => return Err(ArbiterError::NotBound(path.to_string())),
        };

        let bound = self.profiles.find_by_serial(&serial)?;
        let chosen = match profile {
            Some(requested) => bound
                .iter()
                .find(|p| p.id == requested)
                .map(|p| p.id.clone())
                .ok_or(ArbiterError::UnknownProfile(requested))?,
            None => bound
                .iter()
                .map(|p| p.id.clone())
                .min()
                .ok_or_else(|| ArbiterError::NoProfile(path.to_string()))?,
        };

        // A claim on a serial whose path is merely Bound belongs to another
        // path carrying the same serial.
        if let Some(holder) = self.claims.holder(&serial).cloned() {
            if holder != chosen {
                return Err(self.deny(path, chosen, holder));
            }
            let other = self.connected_path(&serial).unwrap_or_default();
            debug!(path = %path, other = %other, profile = %chosen, "profile already connected through another path");
            return Err(ArbiterError::ClaimedThroughOtherPath {
                profile: chosen,
                path: other,
            });
        }
        let claim = self
            .claims
            .acquire(&serial, &chosen)
            .map_err(|conflict| ArbiterError::AlreadyClaimed {
                blocking: conflict.holder,
            })?
            .clone();

        info!(path = %path, serial = %serial, profile = %chosen, "profile connected");
        self.devices.insert(
            path.to_string(),
            DeviceState::Connected {
                serial: serial.clone(),
                profile: chosen.clone(),
            },
        );
        self.pending_events.push(ArbiterEvent::Connected {
            path: path.to_string(),
            serial,
            profile: chosen,
        });
        Ok(claim)
    }

    /// Releases the claim held through `path`.  A device that is not
    /// connected is left as it is.
    ///
    /// # Errors
    ///
    /// [`ArbiterError::UnknownDevice`] if nothing is present at `path`.
    pub fn disconnect(&mut self, path: &str) -> Result<(), ArbiterError> {
        let state = self
            .devices
            .get(path)
            .ok_or_else(|| ArbiterError::UnknownDevice(path.to_string()))?;
        let DeviceState::Connected { serial, profile } = state.clone() else {
            return Ok(());
        };

        self.claims.release(&serial);
        info!(path = %path, serial = %serial, profile = %profile, "profile disconnected");
        self.devices.insert(
            path.to_string(),
            DeviceState::Bound {
                serial: serial.clone(),
            },
        );
        self.pending_events.push(ArbiterEvent::Disconnected {
            path: path.to_string(),
            serial,
            profile,
        });
        Ok(())
    }

    /// Deletes a profile record; refused while the profile is connected.
    ///
    /// # Errors
    ///
    /// [`ArbiterError::Store`] wrapping `RecordLocked`, `NotFound`, or I/O.
    pub fn delete_profile(&mut self, record: &Path) -> Result<(), ArbiterError> {
        self.profiles.delete(record, &self.claims)?;
        Ok(())
    }

    // ── Views ─────────────────────────────────────────────────────────────────

    /// Every tracked device ordered by path, with its profiles re-read.
    ///
    /// The store is read once per call, however many devices are tracked.
    pub fn views(&self) -> Vec<DeviceView> {
        let by_serial = self.profiles_by_serial();
        let mut views: Vec<DeviceView> = self
            .devices
            .iter()
            .map(|(path, state)| {
                let profiles = match state {
                    DeviceState::Bound { serial } | DeviceState::Connected { serial, .. } => {
                        by_serial.get(serial.as_str()).cloned().unwrap_or_default()
                    }
                    _ => Vec::new(),
                };
                DeviceView {
                    path: path.clone(),
                    state: state.clone(),
                    profiles,
                }
            })
            .collect();
        views.sort_by(|a, b| a.path.cmp(&b.path));
        views
    }

    fn profiles_by_serial(&self) -> HashMap<String, Vec<ProfileId>> {
        if !self.devices.values().any(|s| {
            matches!(s, DeviceState::Bound { .. } | DeviceState::Connected { .. })
        }) {
            return HashMap::new();
        }
        let all = match self.profiles.list() {
            Ok(all) => all,
            Err(e) => {
                warn!(error = %e, "could not read profiles");
                return HashMap::new();
            }
        };
        let mut by_serial: HashMap<String, Vec<ProfileId>> = HashMap::new();
        for profile in all.into_iter().filter(|p| !p.serial_number.is_empty()) {
            by_serial.entry(profile.serial_number).or_default().push(profile.id);
        }
        by_serial
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn begin_identification(&mut self, path: &str) -> IdentifyRequest {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.devices
            .insert(path.to_string(), DeviceState::Identifying { generation });
        debug!(path = %path, generation, "identification started");
        IdentifyRequest {
            path: path.to_string(),
            generation,
        }
    }

    fn restart_where(&mut self, retry: impl Fn(PendingReason) -> bool) -> Vec<IdentifyRequest> {
        let mut paths: Vec<String> = self
            .devices
            .iter()
            .filter_map(|(path, state)| match state {
                DeviceState::Unidentified { reason } if retry(*reason) => Some(path.clone()),
                _ => None,
            })
            .collect();
        paths.sort();
        paths
            .iter()
            .map(|path| self.begin_identification(path))
            .collect()
    }

    fn set_pending(&mut self, path: &str, reason: PendingReason) {
        debug!(path = %path, ?reason, "bridge left unidentified");
        self.devices
            .insert(path.to_string(), DeviceState::Unidentified { reason });
        self.pending_events.push(ArbiterEvent::IdentificationPending {
            path: path.to_string(),
            reason,
        });
    }

    /// Looks up (or creates) the profiles for `serial` and stores the
    /// firmware's device name on each of them.
    fn bind(
        &mut self,
        path: &str,
        serial: &str,
        device_name: Option<&str>,
    ) -> Result<Vec<ProfileId>, StoreError> {
        let mut bound = self.profiles.find_by_serial(serial)?;
        if bound.is_empty() {
            bound.push(self.profiles.create_for_device(serial, path)?);
        }

        if let Some(name) = device_name {
            for profile in bound.iter().filter(|p| p.device_name != name) {
                if let Err(e) = self.profiles.record_device_name(&profile.id, name) {
                    warn!(profile = %profile.id, error = %e, "could not store device name");
                }
            }
        }

        let mut ids: Vec<ProfileId> = bound.into_iter().map(|p| p.id).collect();
        ids.sort();
        Ok(ids)
    }

    /// The path whose device is connected under `serial`.
    fn connected_path(&self, serial: &str) -> Option<String> {
        self.devices.iter().find_map(|(path, state)| match state {
            DeviceState::Connected { serial: s, .. } if s == serial => Some(path.clone()),
            _ => None,
        })
    }

    fn deny(&mut self, path: &str, requested: ProfileId, blocking: ProfileId) -> ArbiterError {
        warn!(path = %path, requested = %requested, blocking = %blocking, "connect denied");
        self.pending_events.push(ArbiterEvent::ClaimDenied {
            path: path.to_string(),
            requested,
            blocking: blocking.clone(),
        });
        ArbiterError::AlreadyClaimed { blocking }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::identify::DeviceIdentity;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    // ── Test double ───────────────────────────────────────────────────────────

    /// In-memory repository; clones share the same records.
    #[derive(Clone, Default)]
    struct MemoryProfiles {
        records: Arc<Mutex<Vec<BridgeProfile>>>,
        reads: Arc<AtomicUsize>,
    }

    impl MemoryProfiles {
        fn with(profiles: &[(&str, &str)]) -> Self {
            let repo = Self::default();
            for (id, serial) in profiles {
                repo.records.lock().unwrap().push(BridgeProfile::new(
                    ProfileId::new(*id),
                    *serial,
                    id.to_uppercase(),
                ));
            }
            repo
        }

        fn get(&self, id: &str) -> Option<BridgeProfile> {
            self.records
                .lock()
                .unwrap()
                .iter()
                .find(|p| p.id.as_str() == id)
                .cloned()
        }

        fn len(&self) -> usize {
            self.records.lock().unwrap().len()
        }
    }

    impl ProfileRepository for MemoryProfiles {
        fn list(&self) -> Result<Vec<BridgeProfile>, StoreError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            let mut all = self.records.lock().unwrap().clone();
            all.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(all)
        }

        fn find_by_serial(&self, serial: &str) -> Result<Vec<BridgeProfile>, StoreError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            let mut found: Vec<BridgeProfile> = self
                .records
                .lock()
                .unwrap()
                .iter()
                .filter(|p| !serial.is_empty() && p.serial_number == serial)
                .cloned()
                .collect();
            found.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(found)
        }

        fn create_for_device(&self, serial: &str, device_path: &str) -> Result<BridgeProfile, StoreError> {
            let name = bridge_core::default_screen_name(device_path);
            let profile = BridgeProfile::new(ProfileId::new(name.to_lowercase()), serial, name);
            self.records.lock().unwrap().push(profile.clone());
            Ok(profile)
        }

        fn record_device_name(&self, id: &ProfileId, name: &str) -> Result<(), StoreError> {
            let mut records = self.records.lock().unwrap();
            let profile = records
                .iter_mut()
                .find(|p| &p.id == id)
                .ok_or_else(|| StoreError::NotFound(id.clone()))?;
            profile.device_name = name.to_string();
            Ok(())
        }

        fn delete(&self, record: &Path, claims: &dyn ClaimCheck) -> Result<(), StoreError> {
            let id = ProfileId::new(record.file_stem().unwrap().to_string_lossy());
            if claims.holds_profile(&id) {
                return Err(StoreError::RecordLocked { id });
            }
            self.records.lock().unwrap().retain(|p| p.id != id);
            Ok(())
        }
    }

    const ACM0: &str = "/dev/ttyACM0";
    const ACM1: &str = "/dev/ttyACM1";

    fn identified(serial: &str) -> IdentifyOutcome {
        IdentifyOutcome::Identified(DeviceIdentity {
            serial: serial.to_string(),
            device_name: Some("Desk Bridge".to_string()),
            config: None,
        })
    }

    fn id(s: &str) -> ProfileId {
        ProfileId::new(s)
    }

    /// Arrives and identifies `path` as `serial`.
    fn bind(arbiter: &mut ConnectionArbiter, path: &str, serial: &str) {
        let req = arbiter.arrived(path).expect("new path");
        arbiter.identification_finished(path, req.generation, identified(serial));
    }

    // ── Identification and binding ────────────────────────────────────────────

    #[test]
    fn test_unknown_serial_creates_default_profile_and_binds() {
        // Arrange
        let repo = MemoryProfiles::default();
        let mut arbiter = ConnectionArbiter::new(Box::new(repo.clone()));

        // Act
        let req = arbiter.arrived(ACM0).unwrap();
        let bound = arbiter.identification_finished(ACM0, req.generation, identified("BR1234"));

        // Assert
        assert_eq!(bound.as_deref(), Some("BR1234"));
        assert_eq!(
            arbiter.state(ACM0),
            Some(&DeviceState::Bound {
                serial: "BR1234".to_string()
            })
        );
        let created = repo.get("bridge-ttyacm0").expect("default profile");
        assert_eq!(created.serial_number, "BR1234");
        assert_eq!(created.device_name, "Desk Bridge");
        let events = arbiter.drain_events();
        assert!(matches!(events[0], ArbiterEvent::Identified { .. }));
        assert!(matches!(
            &events[1],
            ArbiterEvent::Bound { profiles, .. } if profiles == &vec![id("bridge-ttyacm0")]
        ));
    }

    #[test]
    fn test_known_serial_binds_every_matching_profile_without_creating() {
        let repo = MemoryProfiles::with(&[("b", "BR1234"), ("a", "BR1234")]);
        let mut arbiter = ConnectionArbiter::new(Box::new(repo.clone()));

        bind(&mut arbiter, ACM0, "BR1234");

        assert_eq!(repo.len(), 2);
        let events = arbiter.drain_events();
        assert!(events.contains(&ArbiterEvent::Bound {
            path: ACM0.to_string(),
            serial: "BR1234".to_string(),
            profiles: vec![id("a"), id("b")],
        }));
    }

    #[test]
    fn test_busy_device_stays_present_but_unidentified() {
        // Arrange
        let mut arbiter = ConnectionArbiter::new(Box::new(MemoryProfiles::default()));
        let req = arbiter.arrived(ACM0).unwrap();

        // Act
        arbiter.identification_finished(ACM0, req.generation, IdentifyOutcome::Busy);

        // Assert
        assert_eq!(
            arbiter.state(ACM0),
            Some(&DeviceState::Unidentified {
                reason: PendingReason::Busy
            })
        );
        assert!(arbiter
            .drain_events()
            .contains(&ArbiterEvent::IdentificationPending {
                path: ACM0.to_string(),
                reason: PendingReason::Busy
            }));
    }

    #[test]
    fn test_retry_busy_skips_timed_out_devices() {
        // Arrange
        let mut arbiter = ConnectionArbiter::new(Box::new(MemoryProfiles::default()));
        let busy = arbiter.arrived(ACM0).unwrap();
        let slow = arbiter.arrived(ACM1).unwrap();
        arbiter.identification_finished(ACM0, busy.generation, IdentifyOutcome::Busy);
        arbiter.identification_finished(ACM1, slow.generation, IdentifyOutcome::TimedOut);

        // Act
        let retried = arbiter.retry_busy();

        // Assert
        let paths: Vec<&str> = retried.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec![ACM0]);
        assert!(matches!(
            arbiter.state(ACM1),
            Some(DeviceState::Unidentified {
                reason: PendingReason::TimedOut
            })
        ));
    }

    #[test]
    fn test_refresh_retries_every_unidentified_device() {
        // Arrange
        let mut arbiter = ConnectionArbiter::new(Box::new(MemoryProfiles::default()));
        let slow = arbiter.arrived(ACM0).unwrap();
        arbiter.identification_finished(ACM0, slow.generation, IdentifyOutcome::TimedOut);

        // Act
        let retried = arbiter.refresh();
        arbiter.identification_finished(ACM0, retried[0].generation, identified("BR1234"));

        // Assert
        assert_eq!(retried.len(), 1);
        assert!(retried[0].generation > slow.generation);
        assert!(matches!(arbiter.state(ACM0), Some(DeviceState::Bound { .. })));
    }

    #[test]
    fn test_stale_generation_is_discarded() {
        // Arrange
        let mut arbiter = ConnectionArbiter::new(Box::new(MemoryProfiles::default()));
        let first = arbiter.arrived(ACM0).unwrap();
        arbiter.identification_finished(ACM0, first.generation, IdentifyOutcome::TimedOut);
        let second = arbiter.refresh().remove(0);
        arbiter.drain_events();

        // Act
        let applied = arbiter.identification_finished(ACM0, first.generation, identified("BR1234"));

        // Assert
        assert_eq!(applied, None);
        assert_eq!(
            arbiter.state(ACM0),
            Some(&DeviceState::Identifying {
                generation: second.generation
            })
        );
        assert!(arbiter.drain_events().is_empty());
    }

    #[test]
    fn test_result_after_departure_is_discarded() {
        let repo = MemoryProfiles::default();
        let mut arbiter = ConnectionArbiter::new(Box::new(repo.clone()));
        let req = arbiter.arrived(ACM0).unwrap();
        arbiter.departed(ACM0);

        let applied = arbiter.identification_finished(ACM0, req.generation, identified("BR1234"));

        assert_eq!(applied, None);
        assert!(arbiter.state(ACM0).is_none());
        assert_eq!(repo.len(), 0, "no profile may be created for a departed device");
    }

    #[test]
    fn test_duplicate_arrival_is_ignored() {
        let mut arbiter = ConnectionArbiter::new(Box::new(MemoryProfiles::default()));
        assert!(arbiter.arrived(ACM0).is_some());
        assert!(arbiter.arrived(ACM0).is_none());
    }

    // ── Connect / disconnect ──────────────────────────────────────────────────

    #[test]
    fn test_connect_defaults_to_first_profile_by_id() {
        let repo = MemoryProfiles::with(&[("b", "BR1234"), ("a", "BR1234")]);
        let mut arbiter = ConnectionArbiter::new(Box::new(repo));
        bind(&mut arbiter, ACM0, "BR1234");

        let claim = arbiter.connect(ACM0, None).unwrap();

        assert_eq!(claim.owner, id("a"));
        assert_eq!(claim.serial, "BR1234");
    }

    #[test]
    fn test_second_profile_is_denied_while_first_is_connected() {
        // Arrange
        let repo = MemoryProfiles::with(&[("a", "BR1234"), ("b", "BR1234")]);
        let mut arbiter = ConnectionArbiter::new(Box::new(repo));
        bind(&mut arbiter, ACM0, "BR1234");
        arbiter.connect(ACM0, Some(id("a"))).unwrap();
        arbiter.drain_events();

        // Act
        let result = arbiter.connect(ACM0, Some(id("b")));

        // Assert
        assert!(matches!(
            result,
            Err(ArbiterError::AlreadyClaimed { ref blocking }) if *blocking == id("a")
        ));
        assert_eq!(
            arbiter.drain_events(),
            vec![ArbiterEvent::ClaimDenied {
                path: ACM0.to_string(),
                requested: id("b"),
                blocking: id("a"),
            }]
        );
        assert_eq!(arbiter.claims().holder("BR1234"), Some(&id("a")));
    }

    #[test]
    fn test_reconnecting_owner_is_idempotent() {
        let repo = MemoryProfiles::with(&[("a", "BR1234")]);
        let mut arbiter = ConnectionArbiter::new(Box::new(repo));
        bind(&mut arbiter, ACM0, "BR1234");

        let first = arbiter.connect(ACM0, Some(id("a"))).unwrap();
        let again = arbiter.connect(ACM0, None).unwrap();

        assert_eq!(first, again);
        assert_eq!(arbiter.claims().len(), 1);
    }

    #[test]
    fn test_same_serial_on_two_paths_allows_one_connection() {
        // Arrange
        let repo = MemoryProfiles::with(&[("a", "BR1234"), ("b", "BR1234")]);
        let mut arbiter = ConnectionArbiter::new(Box::new(repo));
        bind(&mut arbiter, ACM0, "BR1234");
        bind(&mut arbiter, ACM1, "BR1234");
        arbiter.connect(ACM0, Some(id("a"))).unwrap();

        arbiter.drain_events();

        // Act
        let other_profile = arbiter.connect(ACM1, Some(id("b")));
        let same_profile = arbiter.connect(ACM1, Some(id("a")));

        // Assert
        assert!(matches!(
            other_profile,
            Err(ArbiterError::AlreadyClaimed { ref blocking }) if *blocking == id("a")
        ));
        assert!(matches!(
            same_profile,
            Err(ArbiterError::ClaimedThroughOtherPath { ref profile, ref path })
                if *profile == id("a") && path == ACM0
        ));
        assert!(matches!(arbiter.state(ACM1), Some(DeviceState::Bound { .. })));
        // Only the genuine conflict is reported to observers; a profile never blocks itself.
        let denials: Vec<ArbiterEvent> = arbiter
            .drain_events()
            .into_iter()
            .filter(|e| matches!(e, ArbiterEvent::ClaimDenied { .. }))
            .collect();
        assert_eq!(
            denials,
            vec![ArbiterEvent::ClaimDenied {
                path: ACM1.to_string(),
                requested: id("b"),
                blocking: id("a"),
            }]
        );
    }

    #[test]
    fn test_connect_requires_bound_device() {
        let mut arbiter = ConnectionArbiter::new(Box::new(MemoryProfiles::default()));
        arbiter.arrived(ACM0);

        assert!(matches!(
            arbiter.connect(ACM0, None),
            Err(ArbiterError::NotBound(_))
        ));
        assert!(matches!(
            arbiter.connect(ACM1, None),
            Err(ArbiterError::UnknownDevice(_))
        ));
    }

    #[test]
    fn test_connect_with_foreign_profile_is_rejected() {
        let repo = MemoryProfiles::with(&[("a", "BR1234"), ("z", "BR9999")]);
        let mut arbiter = ConnectionArbiter::new(Box::new(repo));
        bind(&mut arbiter, ACM0, "BR1234");

        assert!(matches!(
            arbiter.connect(ACM0, Some(id("z"))),
            Err(ArbiterError::UnknownProfile(ref p)) if *p == id("z")
        ));
    }

    #[test]
    fn test_disconnect_releases_claim_and_returns_to_bound() {
        // Arrange
        let repo = MemoryProfiles::with(&[("a", "BR1234"), ("b", "BR1234")]);
        let mut arbiter = ConnectionArbiter::new(Box::new(repo));
        bind(&mut arbiter, ACM0, "BR1234");
        arbiter.connect(ACM0, Some(id("a"))).unwrap();

        // Act
        arbiter.disconnect(ACM0).unwrap();

        // Assert
        assert!(arbiter.claims().is_empty());
        assert!(matches!(arbiter.state(ACM0), Some(DeviceState::Bound { .. })));
        assert!(arbiter.connect(ACM0, Some(id("b"))).is_ok());
    }

    #[test]
    fn test_disconnect_of_bound_device_is_noop() {
        let repo = MemoryProfiles::with(&[("a", "BR1234")]);
        let mut arbiter = ConnectionArbiter::new(Box::new(repo));
        bind(&mut arbiter, ACM0, "BR1234");
        arbiter.drain_events();

        arbiter.disconnect(ACM0).unwrap();

        assert!(arbiter.drain_events().is_empty());
    }

    // ── Departure ─────────────────────────────────────────────────────────────

    #[test]
    fn test_departure_releases_claim() {
        // Arrange
        let repo = MemoryProfiles::with(&[("a", "BR1234")]);
        let mut arbiter = ConnectionArbiter::new(Box::new(repo));
        bind(&mut arbiter, ACM0, "BR1234");
        arbiter.connect(ACM0, None).unwrap();
        arbiter.drain_events();

        // Act
        let known = arbiter.departed(ACM0);

        // Assert
        assert!(known);
        assert!(arbiter.claims().is_empty());
        assert_eq!(
            arbiter.drain_events(),
            vec![
                ArbiterEvent::Disconnected {
                    path: ACM0.to_string(),
                    serial: "BR1234".to_string(),
                    profile: id("a"),
                },
                ArbiterEvent::Removed {
                    path: ACM0.to_string()
                },
            ]
        );
    }

    #[test]
    fn test_rearrival_after_departure_starts_fresh() {
        let repo = MemoryProfiles::with(&[("a", "BR1234")]);
        let mut arbiter = ConnectionArbiter::new(Box::new(repo));
        bind(&mut arbiter, ACM0, "BR1234");
        arbiter.departed(ACM0);

        let req = arbiter.arrived(ACM0);

        assert!(req.is_some());
        assert!(matches!(arbiter.state(ACM0), Some(DeviceState::Identifying { .. })));
    }

    #[test]
    fn test_unknown_departure_is_ignored() {
        let mut arbiter = ConnectionArbiter::new(Box::new(MemoryProfiles::default()));
        assert!(!arbiter.departed(ACM0));
        assert!(arbiter.drain_events().is_empty());
    }

    // ── Delete ────────────────────────────────────────────────────────────────

    #[test]
    fn test_delete_is_locked_while_connected() {
        // Arrange
        let repo = MemoryProfiles::with(&[("a", "BR1234")]);
        let mut arbiter = ConnectionArbiter::new(Box::new(repo.clone()));
        bind(&mut arbiter, ACM0, "BR1234");
        arbiter.connect(ACM0, None).unwrap();
        let record = PathBuf::from("/profiles/a.toml");

        // Act
        let locked = arbiter.delete_profile(&record);
        arbiter.disconnect(ACM0).unwrap();
        let unlocked = arbiter.delete_profile(&record);

        // Assert
        assert!(matches!(
            locked,
            Err(ArbiterError::Store(StoreError::RecordLocked { .. }))
        ));
        assert!(unlocked.is_ok());
        assert!(repo.get("a").is_none());
    }

    #[test]
    fn test_views_rederive_profiles_from_store() {
        let repo = MemoryProfiles::with(&[("a", "BR1234")]);
        let mut arbiter = ConnectionArbiter::new(Box::new(repo.clone()));
        bind(&mut arbiter, ACM0, "BR1234");
        repo.records
            .lock()
            .unwrap()
            .push(BridgeProfile::new(id("b"), "BR1234", "Second"));

        let views = arbiter.views();

        assert_eq!(views[0].profiles, vec![id("a"), id("b")]);
    }

    #[test]
    fn test_views_read_store_once_for_many_devices() {
        // Arrange
        let repo = MemoryProfiles::with(&[("a", "BR1"), ("b", "BR2"), ("c", "BR2")]);
        let mut arbiter = ConnectionArbiter::new(Box::new(repo.clone()));
        bind(&mut arbiter, ACM0, "BR1");
        bind(&mut arbiter, ACM1, "BR2");
        arbiter.arrived("/dev/ttyACM2");
        let before = repo.reads.load(Ordering::SeqCst);

        // Act
        let views = arbiter.views();

        // Assert
        assert_eq!(repo.reads.load(Ordering::SeqCst) - before, 1);
        assert_eq!(views[0].profiles, vec![id("a")]);
        assert_eq!(views[1].profiles, vec![id("b"), id("c")]);
        assert!(views[2].profiles.is_empty());
    }
}
