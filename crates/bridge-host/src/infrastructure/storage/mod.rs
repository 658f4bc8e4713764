//! Persistence: host configuration and profile records.

pub mod config;
pub mod migration;
pub mod profile_store;

pub use config::{AppConfig, ConfigError};
pub use profile_store::{ConfigStore, StoreError};
