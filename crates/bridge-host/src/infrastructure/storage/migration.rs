//! Versioned migrations for profile records.
//!
//! Every record carries `schema_version`.  A record without one is version 0.
//! On load the raw TOML table is passed through each step from its version up
//! to [`PROFILE_SCHEMA_VERSION`]; the store writes a migrated record back once
//! so the step never runs again for that file.
//!
//! | From | To | Step |
//! |---|---|---|
//! | 0 | 1 | drop legacy security settings (`[security]`, `tls_*`, client-cert keys) |

use bridge_core::PROFILE_SCHEMA_VERSION;
use thiserror::Error;
use toml::{Table, Value};
use tracing::info;

/// Top-level keys that older versions wrote into every record.
const LEGACY_SECURITY_KEYS: &[&str] = &[
    "tls_enabled",
    "tls_cert_path",
    "tls_key_path",
    "tls_fingerprint",
    "require_client_cert",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MigrationError {
    #[error("record schema version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: i64, supported: u32 },

    #[error("schema_version must be a non-negative integer")]
    InvalidVersion,
}

type Step = fn(&mut Table);

/// `(from_version, step)` in ascending order.
const STEPS: &[(u32, Step)] = &[(0, remove_legacy_security)];

/// Brings `table` up to the current schema.  Returns `true` if anything changed.
///
/// # Errors
///
/// Returns [`MigrationError`] for a malformed or future version.
pub fn migrate(table: &mut Table) -> Result<bool, MigrationError> {
    let version = match table.get("schema_version") {
        None => 0,
        Some(Value::Integer(v)) if *v >= 0 => *v,
        Some(_) => return Err(MigrationError::InvalidVersion),
    };
    if version > i64::from(PROFILE_SCHEMA_VERSION) {
        return Err(MigrationError::UnsupportedVersion {
            found: version,
            supported: PROFILE_SCHEMA_VERSION,
        });
    }

    let mut current = version as u32;
    for (from, step) in STEPS {
        if *from == current {
            step(table);
            current += 1;
        }
    }
    if i64::from(current) == version {
        return Ok(false);
    }
    table.insert("schema_version".to_string(), Value::Integer(i64::from(current)));
    info!(from = version, to = current, "migrated profile record");
    Ok(true)
}

fn remove_legacy_security(table: &mut Table) {
    table.remove("security");
    for key in LEGACY_SECURITY_KEYS {
        table.remove(*key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Table {
        text.parse::<Table>().expect("valid toml")
    }

    #[test]
    fn test_unversioned_record_drops_security_settings() {
        // Arrange
        let mut table = parse(
            r#"
serial_number = "BR1234"
screen_name = "Desk"
tls_enabled = true
require_client_cert = false

[security]
fingerprint_db = "/old/path"
"#,
        );

        // Act
        let changed = migrate(&mut table).unwrap();

        // Assert
        assert!(changed);
        assert!(!table.contains_key("security"));
        assert!(!table.contains_key("tls_enabled"));
        assert!(!table.contains_key("require_client_cert"));
        assert_eq!(table["serial_number"].as_str(), Some("BR1234"));
        assert_eq!(table["schema_version"].as_integer(), Some(1));
    }

    #[test]
    fn test_current_record_is_untouched() {
        let mut table = parse("schema_version = 1\nscreen_name = \"Desk\"");
        let before = table.clone();
        assert!(!migrate(&mut table).unwrap());
        assert_eq!(table, before);
    }

    #[test]
    fn test_future_version_is_rejected() {
        let mut table = parse("schema_version = 99");
        assert_eq!(
            migrate(&mut table),
            Err(MigrationError::UnsupportedVersion {
                found: 99,
                supported: PROFILE_SCHEMA_VERSION
            })
        );
    }

    #[test]
    fn test_non_integer_version_is_rejected() {
        let mut table = parse("schema_version = \"one\"");
        assert_eq!(migrate(&mut table), Err(MigrationError::InvalidVersion));
    }
}
