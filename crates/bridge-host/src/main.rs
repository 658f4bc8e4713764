//! Bridge host entry point.
//!
//! Wires the device monitor, the serial identifier, and the profile store
//! into the arbiter service and runs it until Ctrl-C.
//!
//! # Usage
//!
//! ```text
//! bridge-host [OPTIONS]
//!
//! Options:
//!   --config <FILE>        Host config file [default: platform config dir]
//!   --profiles-dir <DIR>   Profile record directory (overrides the config)
//!   --once                 Enumerate, identify, print a JSON snapshot, exit
//! ```
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ load AppConfig
//!  └─ ArbiterService::new(arbiter, monitor, identifier)
//!       ├─ DeviceMonitor      (sysfs / serialport enumeration on each tick)
//!       ├─ SerialIdentifier   (blocking serial exchange on the blocking pool)
//!       └─ ConfigStore        (one TOML record per profile)
//!  └─ event logger            (broadcast subscriber)
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use bridge_host::application::arbiter::ConnectionArbiter;
use bridge_host::application::service::ArbiterService;
use bridge_host::infrastructure::device_monitor::{default_source, DeviceMonitor};
use bridge_host::infrastructure::storage::config::{load_config, load_config_from, AppConfig};
use bridge_host::infrastructure::storage::ConfigStore;
use bridge_host::infrastructure::transport::identifier::SerialIdentifier;
use bridge_host::infrastructure::transport::serial::SerialPortOpener;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// USB HID bridge host.
///
/// Watches for bridge devices, identifies them over their serial control
/// channel, and binds each one to a saved profile.
#[derive(Debug, Parser)]
#[command(
    name = "bridge-host",
    about = "Device binding and claim arbitration for USB HID bridges",
    version
)]
struct Cli {
    /// Host config file.  Defaults to `config.toml` in the platform config
    /// directory; a missing file means built-in defaults.
    #[arg(long, env = "BRIDGE_HOST_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding one TOML record per profile.
    #[arg(long, env = "BRIDGE_PROFILES_DIR")]
    profiles_dir: Option<PathBuf>,

    /// Enumerate and identify once, print a JSON snapshot, and exit.
    #[arg(long)]
    once: bool,
}

impl Cli {
    /// Loads the host config and applies command-line overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be read or parsed.
    fn load_config(&self) -> anyhow::Result<AppConfig> {
        let mut config = match &self.config {
            Some(path) => load_config_from(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            None => load_config().context("failed to load config")?,
        };
        if let Some(dir) = &self.profiles_dir {
            config.profiles.directory = Some(dir.clone());
        }
        Ok(config)
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;

    // Initialise structured logging.  `RUST_LOG` overrides the configured level.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.host.log_level)),
        )
        .init();

    let store = ConfigStore::from_config(&config).context("no profile directory available")?;
    info!(profiles = %store.dir().display(), "bridge host starting");

    let monitor = DeviceMonitor::new(
        default_source(),
        config.monitor.signature(),
        config.monitor.strict_product_match,
    );
    let opener = Arc::new(SerialPortOpener::new(config.transport.baud_rate));
    let identifier = Arc::new(SerialIdentifier::new(opener, config.transport.timeout()));
    let arbiter = ConnectionArbiter::new(Box::new(store));
    let (service, handle) =
        ArbiterService::new(arbiter, monitor, identifier, config.monitor.poll_interval());

    if cli.once {
        let snapshot = service.run_once().await;
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    // ── Event logger ──────────────────────────────────────────────────────────
    let mut events = handle.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => info!(event = %serde_json::to_string(&event).unwrap_or_default(), "arbiter"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event logger lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    // ── Ctrl-C handler ────────────────────────────────────────────────────────
    let shutdown = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            shutdown.shutdown().await;
        }
    });

    info!("bridge host ready.  Press Ctrl-C to exit.");
    service.run().await;
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["bridge-host"]);
        assert!(cli.config.is_none());
        assert!(cli.profiles_dir.is_none());
        assert!(!cli.once);
    }

    #[test]
    fn test_cli_overrides() {
        // Arrange
        let cli = Cli::parse_from([
            "bridge-host",
            "--config",
            "/tmp/host.toml",
            "--profiles-dir",
            "/tmp/profiles",
            "--once",
        ]);

        // Assert
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/host.toml")));
        assert_eq!(cli.profiles_dir, Some(PathBuf::from("/tmp/profiles")));
        assert!(cli.once);
    }

    #[test]
    fn test_profiles_dir_flag_overrides_config() {
        let cli = Cli::parse_from([
            "bridge-host",
            "--config",
            "/nonexistent/bridge-host.toml",
            "--profiles-dir",
            "/tmp/profiles",
        ]);

        let config = cli.load_config().unwrap();

        assert_eq!(config.profiles.directory, Some(PathBuf::from("/tmp/profiles")));
        assert_eq!(config.transport.timeout_ms, 1000);
    }
}
