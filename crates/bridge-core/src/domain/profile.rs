//! Persisted bridge profiles and their screen bondings.
//!
//! A [`BridgeProfile`] is the configuration of one logical screen driven by a
//! bridge.  Profiles are bound to a physical device by serial number; several
//! profiles may share a serial (one device, several host machines), but only
//! one of them may be connected at a time.
//!
//! # Bondings (for beginners)
//!
//! The firmware keeps a small table of "profile slots", one per host the
//! bridge has been paired with.  A [`ScreenBonding`] records where the screen
//! for slot `profile_index` sits relative to this one.  The *presence* of an
//! entry means "bonded"; there is no separate flag.  That is why `(0, 0)` is a
//! perfectly valid bonded offset and why [`BridgeProfile::has_bonding`] is the
//! only way to ask whether a slot is bonded.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Current on-disk schema version of a profile record.
pub const PROFILE_SCHEMA_VERSION: u32 = 1;

/// Activation state stored when nothing else is known.
pub const UNKNOWN_ACTIVATION_STATE: &str = "unknown";

/// Stable identifier of a profile (the record's file stem).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProfileId(String);

impl ProfileId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Relative placement of a bonded screen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BondingOffset {
    pub x: i32,
    pub y: i32,
}

impl BondingOffset {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// One bonded profile slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenBonding {
    pub profile_index: u8,
    pub x: i32,
    pub y: i32,
}

impl ScreenBonding {
    pub fn offset(&self) -> BondingOffset {
        BondingOffset::new(self.x, self.y)
    }
}

/// Persisted configuration for one logical screen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeProfile {
    /// Derived from the record's location, never written into the record.
    #[serde(skip)]
    pub id: ProfileId,
    #[serde(default)]
    pub schema_version: u32,
    /// Binding key; empty until the device is first identified.
    #[serde(default)]
    pub serial_number: String,
    pub screen_name: String,
    #[serde(default = "default_activation_state")]
    pub activation_state: String,
    #[serde(default)]
    pub device_name: String,
    #[serde(default)]
    pub active_profile_hostname: String,
    #[serde(default, rename = "bonding", skip_serializing_if = "Vec::is_empty")]
    pub bondings: Vec<ScreenBonding>,
}

fn default_activation_state() -> String {
    UNKNOWN_ACTIVATION_STATE.to_string()
}

impl BridgeProfile {
    /// A fresh profile bound to `serial_number`.
    pub fn new(id: ProfileId, serial_number: impl Into<String>, screen_name: impl Into<String>) -> Self {
        let serial_number: String = serial_number.into();
        Self {
            id,
            schema_version: PROFILE_SCHEMA_VERSION,
            serial_number: normalize_serial(&serial_number).to_string(),
            screen_name: screen_name.into(),
            activation_state: default_activation_state(),
            device_name: String::new(),
            active_profile_hostname: String::new(),
            bondings: Vec::new(),
        }
    }

    pub fn has_bonding(&self, profile_index: u8) -> bool {
        self.bondings.iter().any(|b| b.profile_index == profile_index)
    }

    /// Offset of a slot; `(0, 0)` when the slot is not bonded.
    pub fn bonding(&self, profile_index: u8) -> BondingOffset {
        self.bondings
            .iter()
            .find(|b| b.profile_index == profile_index)
            .map(ScreenBonding::offset)
            .unwrap_or_default()
    }

    /// Inserts or replaces the bonding for a slot.  Entries stay ordered by index.
    pub fn set_bonding(&mut self, profile_index: u8, offset: BondingOffset) {
        let entry = ScreenBonding {
            profile_index,
            x: offset.x,
            y: offset.y,
        };
        match self
            .bondings
            .binary_search_by_key(&profile_index, |b| b.profile_index)
        {
            Ok(pos) => self.bondings[pos] = entry,
            Err(pos) => self.bondings.insert(pos, entry),
        }
    }

    /// Removes the bonding for a slot; returns whether one existed.
    pub fn clear_bonding(&mut self, profile_index: u8) -> bool {
        let before = self.bondings.len();
        self.bondings.retain(|b| b.profile_index != profile_index);
        self.bondings.len() != before
    }

    pub fn set_activation_state(&mut self, state: &str) {
        self.activation_state = normalize_activation_state(state);
    }
}

/// Canonical form of a serial number for storage and matching.
///
/// Firmware pads some serial strings with whitespace or a trailing newline.
pub fn normalize_serial(serial: &str) -> &str {
    serial.trim()
}

/// Trims and lower-cases an activation state; empty input becomes `"unknown"`.
pub fn normalize_activation_state(state: &str) -> String {
    let trimmed = state.trim();
    if trimmed.is_empty() {
        default_activation_state()
    } else {
        trimmed.to_lowercase()
    }
}

/// Default screen name for a newly seen device: `Bridge-<port name>`.
///
/// `/dev/ttyACM0` → `Bridge-ttyACM0`, `\\.\COM3` → `Bridge-COM3`.
pub fn default_screen_name(device_path: &str) -> String {
    let port = device_path
        .rsplit(['/', '\\'])
        .find(|s| !s.is_empty() && *s != ".")
        .unwrap_or("");
    if port.is_empty() {
        "Bridge".to_string()
    } else {
        format!("Bridge-{port}")
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> BridgeProfile {
        BridgeProfile::new(ProfileId::new("desk"), "BR1234", "Desk")
    }

    // ── Bondings ──────────────────────────────────────────────────────────────

    #[test]
    fn test_unbonded_slot_reads_zero_but_is_not_bonded() {
        let p = profile();
        assert_eq!(p.bonding(2), BondingOffset::new(0, 0));
        assert!(!p.has_bonding(2));
    }

    #[test]
    fn test_zero_offset_counts_as_bonded() {
        // Arrange
        let mut p = profile();

        // Act
        p.set_bonding(0, BondingOffset::new(0, 0));

        // Assert
        assert!(p.has_bonding(0));
        assert_eq!(p.bonding(0), BondingOffset::default());
    }

    #[test]
    fn test_set_bonding_replaces_existing_slot() {
        let mut p = profile();
        p.set_bonding(1, BondingOffset::new(10, 20));
        p.set_bonding(1, BondingOffset::new(-5, 7));
        assert_eq!(p.bondings.len(), 1);
        assert_eq!(p.bonding(1), BondingOffset::new(-5, 7));
    }

    #[test]
    fn test_bondings_stay_sorted_by_index() {
        let mut p = profile();
        p.set_bonding(3, BondingOffset::new(3, 3));
        p.set_bonding(0, BondingOffset::new(0, 1));
        p.set_bonding(2, BondingOffset::new(2, 2));
        let indices: Vec<u8> = p.bondings.iter().map(|b| b.profile_index).collect();
        assert_eq!(indices, vec![0, 2, 3]);
    }

    #[test]
    fn test_clear_bonding_removes_slot() {
        // Arrange
        let mut p = profile();
        p.set_bonding(1, BondingOffset::new(0, 0));

        // Act
        let removed = p.clear_bonding(1);

        // Assert
        assert!(removed);
        assert!(!p.has_bonding(1));
        assert!(!p.clear_bonding(1));
    }

    // ── Activation state ──────────────────────────────────────────────────────

    #[test]
    fn test_activation_state_is_normalized() {
        assert_eq!(normalize_activation_state("  Activated \n"), "activated");
        assert_eq!(normalize_activation_state(""), "unknown");
        let mut p = profile();
        p.set_activation_state("TRIAL");
        assert_eq!(p.activation_state, "trial");
    }

    // ── Default screen names ──────────────────────────────────────────────────

    #[test]
    fn test_default_screen_name_from_unix_path() {
        assert_eq!(default_screen_name("/dev/ttyACM0"), "Bridge-ttyACM0");
    }

    #[test]
    fn test_default_screen_name_from_windows_path() {
        assert_eq!(default_screen_name(r"\\.\COM3"), "Bridge-COM3");
        assert_eq!(default_screen_name("COM7"), "Bridge-COM7");
    }

    #[test]
    fn test_default_screen_name_for_empty_path() {
        assert_eq!(default_screen_name(""), "Bridge");
    }

    // ── Serialization ─────────────────────────────────────────────────────────

    #[test]
    fn test_profile_toml_round_trip_skips_id() {
        // Arrange
        let mut p = profile();
        p.set_bonding(0, BondingOffset::new(0, 0));
        p.set_bonding(1, BondingOffset::new(1920, 0));

        // Act
        let text = toml::to_string(&p).unwrap();
        let mut restored: BridgeProfile = toml::from_str(&text).unwrap();

        // Assert
        assert!(!text.contains("desk"), "id must not be persisted");
        assert!(text.contains("bonding"));
        assert_eq!(restored.id, ProfileId::default());
        restored.id = p.id.clone();
        assert_eq!(restored, p);
    }

    #[test]
    fn test_profile_missing_optional_fields_uses_defaults() {
        let p: BridgeProfile = toml::from_str("screen_name = \"Old\"").unwrap();
        assert_eq!(p.schema_version, 0);
        assert_eq!(p.activation_state, "unknown");
        assert!(p.serial_number.is_empty());
        assert!(p.bondings.is_empty());
    }

    #[test]
    fn test_new_profile_stores_trimmed_serial() {
        let p = BridgeProfile::new(ProfileId::new("a"), " BR1234\n", "Desk");
        assert_eq!(p.serial_number, "BR1234");
        assert_eq!(normalize_serial("\tBR1 "), "BR1");
    }
}
