//! Claim table: the single source of truth for device exclusivity.
//!
//! A [`ConnectionClaim`] says "profile P is connected to the bridge with
//! serial S".  The table holds at most one claim per serial, so two profiles
//! bound to the same physical bridge can never both be connected.
//!
//! # Check-and-set (for beginners)
//!
//! [`ClaimTable::acquire`] checks for an existing claim and inserts the new
//! one in a single call on `&mut self`.  Only the arbiter's processing task
//! owns the table, so no other caller can slip in between the check and the
//! insert.  Two racing connect requests are handled one after the other; the
//! second sees the first one's claim and is denied.

use std::collections::HashMap;
use std::time::SystemTime;

use bridge_core::ProfileId;
use serde::Serialize;

/// Read-only view used by storage to refuse deleting a claimed profile.
pub trait ClaimCheck {
    /// Whether `profile` currently holds any claim.
    fn holds_profile(&self, profile: &ProfileId) -> bool;
}

/// Exclusivity lock for one serial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionClaim {
    pub serial: String,
    pub owner: ProfileId,
    pub acquired_at: SystemTime,
}

/// `acquire` failed because another profile holds the serial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimConflict {
    pub holder: ProfileId,
}

#[derive(Debug, Default)]
pub struct ClaimTable {
    claims: HashMap<String, ConnectionClaim>,
}

impl ClaimTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `serial` for `owner`.  Re-acquiring by the current owner keeps
    /// the original claim.
    ///
    /// # Errors
    ///
    /// Returns [`ClaimConflict`] naming the holder when another profile owns it.
    pub fn acquire(&mut self, serial: &str, owner: &ProfileId) -> Result<&ConnectionClaim, ClaimConflict> {
        if let Some(existing) = self.claims.get(serial) {
            if &existing.owner != owner {
                return Err(ClaimConflict {
                    holder: existing.owner.clone(),
                });
            }
        }
        Ok(self
            .claims
            .entry(serial.to_string())
            .or_insert_with(|| ConnectionClaim {
                serial: serial.to_string(),
                owner: owner.clone(),
                acquired_at: SystemTime::now(),
            }))
    }

    /// Releases the claim on `serial` regardless of owner.
    pub fn release(&mut self, serial: &str) -> Option<ConnectionClaim> {
        self.claims.remove(serial)
    }

    pub fn holder(&self, serial: &str) -> Option<&ProfileId> {
        self.claims.get(serial).map(|c| &c.owner)
    }

    pub fn get(&self, serial: &str) -> Option<&ConnectionClaim> {
        self.claims.get(serial)
    }

    /// All live claims ordered by serial.
    pub fn all(&self) -> Vec<ConnectionClaim> {
        let mut claims: Vec<ConnectionClaim> = self.claims.values().cloned().collect();
        claims.sort_by(|a, b| a.serial.cmp(&b.serial));
        claims
    }

    pub fn len(&self) -> usize {
        self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }
}

impl ClaimCheck for ClaimTable {
    fn holds_profile(&self, profile: &ProfileId) -> bool {
        self.claims.values().any(|c| &c.owner == profile)
    }
}
