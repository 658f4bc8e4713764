//! File-backed profile repository.
//!
//! Every [`BridgeProfile`] lives in its own `<id>.toml` file inside the
//! profiles directory; the file stem *is* the profile id and is never written
//! into the record itself.  Every mutation is written to disk immediately, so
//! the files are the single source of truth and nothing is cached here.
//!
//! Records are passed through [`migration::migrate`] on load.  A record that
//! needed migrating is written back straight away.

use std::fs;
use std::path::{Path, PathBuf};

use bridge_core::{default_screen_name, normalize_serial, BondingOffset, BridgeProfile, ProfileId};
use thiserror::Error;
use toml::{Table, Value};
use tracing::{debug, info, warn};

use super::config::{AppConfig, ConfigError};
use super::migration::{self, MigrationError};
use crate::application::arbiter::ProfileRepository;
use crate::application::claims::ClaimCheck;

const RECORD_EXTENSION: &str = "toml";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    #[error("I/O error accessing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse profile record {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to serialize profile: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("cannot migrate profile record {path}: {source}")]
    Migration {
        path: PathBuf,
        #[source]
        source: MigrationError,
    },

    #[error("profile {id} is connected and cannot be deleted")]
    RecordLocked { id: ProfileId },

    #[error("a profile for serial {serial} already exists ({existing})")]
    DuplicateSerial { serial: String, existing: ProfileId },

    #[error("screen name {name:?} is already used by profile {existing}")]
    DuplicateScreenName { name: String, existing: ProfileId },

    #[error("profile {0} not found")]
    NotFound(ProfileId),

    #[error("{path} is not a profile record in this store")]
    NotARecord { path: PathBuf },
}

/// Profile records under one directory.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    dir: PathBuf,
}

impl ConfigStore {
    /// A store rooted at `dir`.  The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// A store at the directory configured in `config`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NoPlatformConfigDir`] when no directory is
    /// configured and the platform default cannot be determined.
    pub fn from_config(config: &AppConfig) -> Result<Self, StoreError> {
        config
            .profiles_dir()
            .map(Self::new)
            .map_err(|_: ConfigError| StoreError::NoPlatformConfigDir)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Record file for `id`.
    pub fn path_for(&self, id: &ProfileId) -> PathBuf {
        self.dir.join(format!("{}.{RECORD_EXTENSION}", id.as_str()))
    }

    /// The id a record file stands for.
    pub fn id_for(path: &Path) -> Option<ProfileId> {
        path.file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .map(ProfileId::new)
    }

    // ── Reading ───────────────────────────────────────────────────────────────

    /// Every readable record, ordered by id.  Unreadable records are logged
    /// and skipped; a missing directory is an empty store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the directory exists but cannot be listed.
    pub fn list(&self) -> Result<Vec<BridgeProfile>, StoreError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.dir.clone(),
                    source,
                })
            }
        };

        let mut profiles = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            match self.load(&path) {
                Ok(profile) => profiles.push(profile),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable profile record"),
            }
        }
        profiles.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(profiles)
    }

    /// Reads one record, migrating it first if it is out of date.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`], [`StoreError::Parse`] or
    /// [`StoreError::Migration`].
    pub fn load(&self, path: &Path) -> Result<BridgeProfile, StoreError> {
        let text = fs::read_to_string(path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut table: Table = text.parse().map_err(|source| StoreError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        let migrated = migration::migrate(&mut table).map_err(|source| StoreError::Migration {
            path: path.to_path_buf(),
            source,
        })?;
        if migrated {
            write_record(path, &toml::to_string_pretty(&table)?)?;
            info!(path = %path.display(), "wrote migrated profile record");
        }

        let mut profile: BridgeProfile =
            Value::Table(table)
                .try_into()
                .map_err(|source| StoreError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?;
        profile.id = Self::id_for(path).unwrap_or_default();
        profile.serial_number = normalize_serial(&profile.serial_number).to_string();
        Ok(profile)
    }

    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when no record exists for `id`.
    pub fn get(&self, id: &ProfileId) -> Result<BridgeProfile, StoreError> {
        let path = self.path_for(id);
        if !path.exists() {
            return Err(StoreError::NotFound(id.clone()));
        }
        self.load(&path)
    }

    /// All records bound to `serial`.  Several records may share a serial; an
    /// empty serial matches nothing.
    ///
    /// # Errors
    ///
    /// See [`ConfigStore::list`].
    pub fn find_by_serial(&self, serial: &str) -> Result<Vec<BridgeProfile>, StoreError> {
        let serial = normalize_serial(serial);
        if serial.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .list()?
            .into_iter()
            .filter(|p| p.serial_number == serial)
            .collect())
    }

    /// # Errors
    ///
    /// See [`ConfigStore::list`].
    pub fn find_by_screen_name(&self, name: &str) -> Result<Option<BridgeProfile>, StoreError> {
        Ok(self.list()?.into_iter().find(|p| p.screen_name == name))
    }

    // ── Writing ───────────────────────────────────────────────────────────────

    /// Writes `profile` to its record file, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] or [`StoreError::Serialize`].
    pub fn save(&self, profile: &BridgeProfile) -> Result<PathBuf, StoreError> {
        fs::create_dir_all(&self.dir).map_err(|source| StoreError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let path = self.path_for(&profile.id);
        write_record(&path, &toml::to_string_pretty(profile)?)?;
        debug!(profile = %profile.id, path = %path.display(), "saved profile record");
        Ok(path)
    }

    /// Creates and persists a profile for a newly seen device.
    ///
    /// The screen name is `Bridge-<port name>`, suffixed `-2`, `-3`, … if that
    /// name is taken.  Returns the new record's path.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DuplicateSerial`] if a record for `serial` exists.
    pub fn create_default(&self, serial: &str, device_path: &str) -> Result<PathBuf, StoreError> {
        let serial = normalize_serial(serial);
        let existing = self.list()?;
        if let Some(found) = existing.iter().find(|p| !serial.is_empty() && p.serial_number == serial) {
            return Err(StoreError::DuplicateSerial {
                serial: serial.to_string(),
                existing: found.id.clone(),
            });
        }

        let base = default_screen_name(device_path);
        let screen_name = first_free(&base, |name| existing.iter().any(|p| p.screen_name == name));
        let stem = record_stem(&screen_name);
        let id = ProfileId::new(first_free(&stem, |candidate| {
            self.path_for(&ProfileId::new(candidate)).exists()
        }));

        let profile = BridgeProfile::new(id, serial, screen_name);
        let path = self.save(&profile)?;
        info!(
            profile = %profile.id,
            serial = %serial,
            screen_name = %profile.screen_name,
            "created default profile"
        );
        Ok(path)
    }

    /// Renames a profile's screen.  Screen names are unique across the store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DuplicateScreenName`] if another profile uses `name`.
    pub fn set_screen_name(&self, id: &ProfileId, name: &str) -> Result<BridgeProfile, StoreError> {
        if let Some(other) = self.find_by_screen_name(name)? {
            if &other.id != id {
                return Err(StoreError::DuplicateScreenName {
                    name: name.to_string(),
                    existing: other.id,
                });
            }
        }
        self.update(id, |p| p.screen_name = name.to_string())
    }

    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] or a write failure.
    pub fn set_device_name(&self, id: &ProfileId, name: &str) -> Result<BridgeProfile, StoreError> {
        self.update(id, |p| p.device_name = name.to_string())
    }

    /// Stores the state trimmed and lower-cased; blank becomes `unknown`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] or a write failure.
    pub fn set_activation_state(&self, id: &ProfileId, state: &str) -> Result<BridgeProfile, StoreError> {
        self.update(id, |p| p.set_activation_state(state))
    }

    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] or a write failure.
    pub fn set_active_hostname(&self, id: &ProfileId, hostname: &str) -> Result<BridgeProfile, StoreError> {
        self.update(id, |p| p.active_profile_hostname = hostname.trim().to_string())
    }

    // ── Bondings ──────────────────────────────────────────────────────────────

    /// Offset of a slot; `(0, 0)` when unbonded.  Use [`ConfigStore::has_bonding`]
    /// to tell the two apart.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] or a read failure.
    pub fn read_bonding(&self, id: &ProfileId, profile_index: u8) -> Result<BondingOffset, StoreError> {
        Ok(self.get(id)?.bonding(profile_index))
    }

    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] or a read failure.
    pub fn has_bonding(&self, id: &ProfileId, profile_index: u8) -> Result<bool, StoreError> {
        Ok(self.get(id)?.has_bonding(profile_index))
    }

    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] or a write failure.
    pub fn write_bonding(
        &self,
        id: &ProfileId,
        profile_index: u8,
        offset: BondingOffset,
    ) -> Result<(), StoreError> {
        self.update(id, |p| p.set_bonding(profile_index, offset))
            .map(|_| ())
    }

    /// Removes a slot's bonding.  Returns whether one existed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] or a write failure.
    pub fn clear_bonding(&self, id: &ProfileId, profile_index: u8) -> Result<bool, StoreError> {
        let mut profile = self.get(id)?;
        let removed = profile.clear_bonding(profile_index);
        if removed {
            self.save(&profile)?;
        }
        Ok(removed)
    }

    // ── Deleting ──────────────────────────────────────────────────────────────

    /// Deletes the record at `path` unless its profile holds a claim.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::RecordLocked`] while the profile is connected,
    /// [`StoreError::NotFound`] if there is no such record, and
    /// [`StoreError::NotARecord`] for any path that is not a record file
    /// directly inside the store directory.
    pub fn delete(&self, path: &Path, claims: &dyn ClaimCheck) -> Result<(), StoreError> {
        let (record, id) = self.resolve_record(path)?;
        if claims.holds_profile(&id) {
            return Err(StoreError::RecordLocked { id });
        }
        match fs::remove_file(&record) {
            Ok(()) => {
                info!(profile = %id, "deleted profile record");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound(id)),
            Err(source) => Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Canonical path and id of the record at `path`.  Symlinks are resolved
    /// before the containment check.
    fn resolve_record(&self, path: &Path) -> Result<(PathBuf, ProfileId), StoreError> {
        let not_a_record = || StoreError::NotARecord {
            path: path.to_path_buf(),
        };
        if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
            return Err(not_a_record());
        }
        let id = Self::id_for(path).ok_or_else(not_a_record)?;

        let record = match fs::canonicalize(path) {
            Ok(record) => record,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id))
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let dir = fs::canonicalize(&self.dir).map_err(|_| not_a_record())?;
        if record.parent() != Some(dir.as_path())
            || record.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION)
        {
            warn!(path = %path.display(), "refusing to delete file outside the profile store");
            return Err(not_a_record());
        }
        let id = Self::id_for(&record).unwrap_or(id);
        Ok((record, id))
    }

    fn update(
        &self,
        id: &ProfileId,
        change: impl FnOnce(&mut BridgeProfile),
    ) -> Result<BridgeProfile, StoreError> {
        let mut profile = self.get(id)?;
        change(&mut profile);
        self.save(&profile)?;
        Ok(profile)
    }
}

impl ProfileRepository for ConfigStore {
    fn find_by_serial(&self, serial: &str) -> Result<Vec<BridgeProfile>, StoreError> {
        ConfigStore::find_by_serial(self, serial)
    }

    fn list(&self) -> Result<Vec<BridgeProfile>, StoreError> {
        ConfigStore::list(self)
    }

    fn create_for_device(&self, serial: &str, device_path: &str) -> Result<BridgeProfile, StoreError> {
        let path = self.create_default(serial, device_path)?;
        self.load(&path)
    }

    fn record_device_name(&self, id: &ProfileId, name: &str) -> Result<(), StoreError> {
        self.set_device_name(id, name).map(|_| ())
    }

    fn delete(&self, record: &Path, claims: &dyn ClaimCheck) -> Result<(), StoreError> {
        ConfigStore::delete(self, record, claims)
    }
}

fn write_record(path: &Path, content: &str) -> Result<(), StoreError> {
    fs::write(path, content).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// `base`, or `base-2`, `base-3`, … whichever is first not `taken`.
fn first_free(base: &str, taken: impl Fn(&str) -> bool) -> String {
    if !taken(base) {
        return base.to_string();
    }
    let mut n = 2u32;
    loop {
        let candidate = format!("{base}-{n}");
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// File-name-safe, lower-case form of a screen name.
fn record_stem(screen_name: &str) -> String {
    let stem: String = screen_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let stem = stem.trim_matches('-');
    if stem.is_empty() {
        "profile".to_string()
    } else {
        stem.to_string()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
