//! Worker configuration.
//!
//! Values come from three layers, later ones winning:
//! 1. built-in defaults
//! 2. a TOML file (`--config worker.toml`)
//! 3. command line flags
//!
//! Example file:
//! ```toml
//! name = "echo"
//! namespace = "com.redhat.Yggdrasil1"
//! bus = "session"
//! lifecycle_events = true
//!
//! [transmit]
//! queue_capacity = 1024
//! max_in_flight = 64
//! call_timeout_secs = 25
//!
//! [echo]
//! loop_count = 3
//! sleep_secs = 0.5
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::error::{Result, WorkerError};
use crate::identity::{WorkerIdentity, DEFAULT_NAMESPACE};
use crate::service::DEFAULT_MAX_CONCURRENT_DISPATCHES;
use crate::signal::DEFAULT_SIGNAL_CAPACITY;
use crate::transmit::{
    TransmitConfig, DEFAULT_CALL_TIMEOUT, DEFAULT_ENQUEUE_TIMEOUT, DEFAULT_MAX_IN_FLIGHT,
    DEFAULT_QUEUE_CAPACITY,
};

/// Which message bus to connect to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    #[default]
    Session,
    System,
    /// Explicit address from `address`.
    Address,
}

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker name, the last element of the bus name.
    pub name: String,
    pub namespace: String,
    pub bus: BusKind,
    /// Bus address, required when `bus = "address"`.
    pub address: Option<String>,

    /// Initial `RemoteContent` property.
    pub remote_content: bool,
    /// Extra entries published in the `Features` property.
    pub features: BTreeMap<String, String>,

    pub max_concurrent_dispatches: usize,
    /// Emit `Begin`/`End` around every dispatch and `Started`/`Stopped`
    /// around the worker lifetime.
    pub lifecycle_events: bool,
    pub signal_capacity: usize,
    /// How long shutdown waits for running handlers.
    pub drain_timeout_secs: f64,

    pub transmit: TransmitSettings,
    pub echo: EchoSettings,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "echo".to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            bus: BusKind::Session,
            address: None,
            remote_content: false,
            features: BTreeMap::new(),
            max_concurrent_dispatches: DEFAULT_MAX_CONCURRENT_DISPATCHES,
            lifecycle_events: false,
            signal_capacity: DEFAULT_SIGNAL_CAPACITY,
            drain_timeout_secs: 5.0,
            transmit: TransmitSettings::default(),
            echo: EchoSettings::default(),
        }
    }
}

/// `[transmit]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransmitSettings {
    pub queue_capacity: usize,
    pub max_in_flight: usize,
    pub call_timeout_secs: f64,
    pub enqueue_timeout_secs: f64,
}

impl Default for TransmitSettings {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            call_timeout_secs: DEFAULT_CALL_TIMEOUT.as_secs_f64(),
            enqueue_timeout_secs: DEFAULT_ENQUEUE_TIMEOUT.as_secs_f64(),
        }
    }
}

/// `[echo]` section, read by the echo worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EchoSettings {
    /// Responses sent per dispatched message.
    pub loop_count: u32,
    /// Pause after each response.
    pub sleep_secs: f64,
}

impl Default for EchoSettings {
    fn default() -> Self {
        Self {
            loop_count: 1,
            sleep_secs: 0.0,
        }
    }
}

impl EchoSettings {
    pub fn sleep(&self) -> Result<Duration> {
        seconds("echo.sleep_secs", self.sleep_secs)
    }
}

impl WorkerConfig {
    /// Load from a TOML file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(WorkerError::Config(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| WorkerError::Config(e.to_string()))
    }

    /// Check values that serde cannot.
    pub fn validate(&self) -> Result<()> {
        self.identity()?;
        self.transmit_config()?;
        self.drain_timeout()?;
        self.echo.sleep()?;
        if self.bus == BusKind::Address && self.address.is_none() {
            return Err(WorkerError::Config(
                "bus = \"address\" requires an address".into(),
            ));
        }
        Ok(())
    }

    pub fn identity(&self) -> Result<WorkerIdentity> {
        WorkerIdentity::with_namespace(&self.namespace, &self.name)
    }

    pub fn transmit_config(&self) -> Result<TransmitConfig> {
        Ok(TransmitConfig {
            queue_capacity: self.transmit.queue_capacity,
            max_in_flight: self.transmit.max_in_flight,
            call_timeout: seconds("transmit.call_timeout_secs", self.transmit.call_timeout_secs)?,
            enqueue_timeout: seconds(
                "transmit.enqueue_timeout_secs",
                self.transmit.enqueue_timeout_secs,
            )?,
        })
    }

    pub fn drain_timeout(&self) -> Result<Duration> {
        seconds("drain_timeout_secs", self.drain_timeout_secs)
    }
}

fn seconds(key: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| WorkerError::Config(format!("{} must be a non-negative number, got {}", key, value)))
}

/// Command line of a worker process.
#[derive(Debug, Clone, Default, Parser)]
#[command(about = "Yggdrasil worker")]
#[command(version)]
pub struct WorkerArgs {
    /// Configuration file (TOML)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Worker name
    #[arg(long)]
    pub name: Option<String>,

    /// Bus namespace
    #[arg(long)]
    pub namespace: Option<String>,

    /// Bus to connect to
    #[arg(long, value_enum)]
    pub bus: Option<BusKind>,

    /// Bus address (implies --bus address)
    #[arg(long)]
    pub address: Option<String>,

    /// Number of loop echoes before finish echoing
    #[arg(long = "loop")]
    pub loop_count: Option<u32>,

    /// Sleep time in seconds after each echo
    #[arg(long)]
    pub sleep: Option<f64>,

    /// Emit Begin/End and Started/Stopped events
    #[arg(long)]
    pub lifecycle_events: bool,
}

impl WorkerArgs {
    /// Merge the config file (if any) and the flags into one validated config.
    pub fn resolve(&self) -> Result<WorkerConfig> {
        let mut config = match &self.config {
            Some(path) => WorkerConfig::load(path)?,
            None => WorkerConfig::default(),
        };

        if let Some(name) = &self.name {
            config.name = name.clone();
        }
        if let Some(namespace) = &self.namespace {
            config.namespace = namespace.clone();
        }
        if let Some(bus) = self.bus {
            config.bus = bus;
        }
        if let Some(address) = &self.address {
            config.address = Some(address.clone());
            if self.bus.is_none() {
                config.bus = BusKind::Address;
            }
        }
        if let Some(loop_count) = self.loop_count {
            config.echo.loop_count = loop_count;
        }
        if let Some(sleep) = self.sleep {
            config.echo.sleep_secs = sleep;
        }
        if self.lifecycle_events {
            config.lifecycle_events = true;
        }

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.identity().unwrap().bus_name(), "com.redhat.Yggdrasil1.Worker1.echo");
        assert_eq!(config.transmit_config().unwrap(), TransmitConfig::default());
        assert_eq!(config.echo.loop_count, 1);
        assert_eq!(config.echo.sleep().unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = WorkerConfig::from_toml(
            r#"
            name = "files"
            bus = "system"

            [transmit]
            max_in_flight = 8

            [features]
            Capabilities = "read"
            "#,
        )
        .unwrap();

        assert_eq!(config.name, "files");
        assert_eq!(config.bus, BusKind::System);
        assert_eq!(config.transmit.max_in_flight, 8);
        assert_eq!(config.transmit.queue_capacity, DEFAULT_QUEUE_CAPACITY);
        assert_eq!(config.features["Capabilities"], "read");
        assert_eq!(config.namespace, DEFAULT_NAMESPACE);
    }

    #[test]
    fn test_bad_toml_is_config_error() {
        let result = WorkerConfig::from_toml("bus = \"carrier-pigeon\"");
        assert!(matches!(result, Err(WorkerError::Config(_))));
    }

    #[test]
    fn test_negative_duration_rejected() {
        let config = WorkerConfig {
            echo: EchoSettings {
                loop_count: 1,
                sleep_secs: -1.0,
            },
            ..WorkerConfig::default()
        };
        assert!(matches!(config.validate(), Err(WorkerError::Config(_))));
    }

    #[test]
    fn test_address_bus_requires_address() {
        let config = WorkerConfig {
            bus: BusKind::Address,
            ..WorkerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let result = WorkerConfig::load(Path::new("/nonexistent/worker.toml"));
        assert!(matches!(result, Err(WorkerError::Config(_))));
    }

    #[test]
    fn test_flags_override_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "name = \"fromfile\"\n[echo]\nloop_count = 5").unwrap();

        let args = WorkerArgs::parse_from([
            "worker",
            "--config",
            file.path().to_str().unwrap(),
            "--loop",
            "2",
            "--sleep",
            "0.25",
            "--address",
            "unix:path=/tmp/bus",
        ]);
        let config = args.resolve().unwrap();

        assert_eq!(config.name, "fromfile");
        assert_eq!(config.echo.loop_count, 2);
        assert_eq!(config.echo.sleep().unwrap(), Duration::from_millis(250));
        assert_eq!(config.bus, BusKind::Address);
        assert_eq!(config.address.as_deref(), Some("unix:path=/tmp/bus"));
    }

    #[test]
    fn test_invalid_name_flag() {
        let args = WorkerArgs::parse_from(["worker", "--name", "no-dashes"]);
        assert!(matches!(args.resolve(), Err(WorkerError::InvalidIdentity(_))));
    }
}
