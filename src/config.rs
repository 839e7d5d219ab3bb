//! TOML configuration file.
//!
//! Every section and field is optional; a missing file section takes the
//! defaults below. Command-line flags are applied on top by [`crate::app`].

use crate::dispatch::QueuePolicy;
use crate::history::DEFAULT_HISTORY_CAPACITY;
use crate::key::KeyResolver;
use crate::mac_address::{MacPrefix, ParseMacError};
use crate::pipeline::AdvertisementFilter;
use crate::registry::DeviceRegistry;
use crate::sink::line_protocol::DEFAULT_MEASUREMENT;
use crate::sink::metrics::MetricsOptions;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid registry entry {key:?}: {reason}")]
    InvalidRegistryEntry { key: String, reason: &'static str },
    #[error("invalid mac_address_prefix {value:?}: {source}")]
    InvalidMacPrefix {
        value: String,
        #[source]
        source: ParseMacError,
    },
}

/// Root of the configuration file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub ble: BleConfig,
    pub device: DeviceConfig,
    pub history: HistoryConfig,
    pub dispatch: DispatchConfig,
    pub influxdb: InfluxDbConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BleConfig {
    /// Address prefix filter, empty to disable
    pub vendor_prefix: String,
    /// Local-name prefix filter, empty to disable
    pub local_name: String,
    pub macos: MacOsConfig,
}

/// Address inference for platforms that hide hardware addresses.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MacOsConfig {
    pub infer_mac_address: bool,
    pub mac_address_prefix: String,
}

impl Default for MacOsConfig {
    fn default() -> Self {
        Self {
            infer_mac_address: false,
            mac_address_prefix: MacPrefix::default().to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceConfig {
    pub registry: BTreeMap<String, DeviceEntry>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceEntry {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HistoryConfig {
    pub capacity: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    #[default]
    Unbounded,
    Bounded,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchConfig {
    pub policy: PolicyKind,
    pub capacity: usize,
    pub timeout_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            policy: PolicyKind::Unbounded,
            capacity: 256,
            timeout_ms: 100,
        }
    }
}

impl DispatchConfig {
    pub fn queue_policy(&self) -> QueuePolicy {
        match self.policy {
            PolicyKind::Unbounded => QueuePolicy::Unbounded,
            PolicyKind::Bounded => QueuePolicy::Bounded {
                capacity: self.capacity,
                timeout: Duration::from_millis(self.timeout_ms),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InfluxDbConfig {
    pub enabled: bool,
    pub measurement: String,
}

impl Default for InfluxDbConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            measurement: DEFAULT_MEASUREMENT.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub textfile: Option<PathBuf>,
    pub expiry_secs: u64,
    pub refresh_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        let defaults = MetricsOptions::default();
        Self {
            enabled: false,
            textfile: None,
            expiry_secs: defaults.expiry.as_secs(),
            refresh_secs: defaults.refresh.as_secs(),
        }
    }
}

impl MetricsConfig {
    pub fn options(&self) -> MetricsOptions {
        MetricsOptions {
            textfile: self.textfile.clone(),
            expiry: Duration::from_secs(self.expiry_secs),
            refresh: Duration::from_secs(self.refresh_secs),
        }
    }
}

impl Config {
    /// Read, parse and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        content.parse()
    }

    /// Reject values that parse but cannot be used.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, entry) in &self.device.registry {
            if entry.name.trim().is_empty() {
                return Err(ConfigError::InvalidRegistryEntry {
                    key: key.clone(),
                    reason: "name is empty",
                });
            }
        }
        self.mac_prefix().map(|_| ())
    }

    pub fn mac_prefix(&self) -> Result<MacPrefix, ConfigError> {
        let value = &self.ble.macos.mac_address_prefix;
        value
            .parse()
            .map_err(|source| ConfigError::InvalidMacPrefix {
                value: value.clone(),
                source,
            })
    }

    /// Device names keyed by lowercased device key.
    pub fn device_registry(&self) -> DeviceRegistry {
        let mut registry = DeviceRegistry::new();
        for (key, entry) in &self.device.registry {
            registry.insert(key, entry.name.clone());
        }
        registry
    }

    pub fn advertisement_filter(&self) -> AdvertisementFilter {
        AdvertisementFilter::new(&self.ble.vendor_prefix, &self.ble.local_name)
    }

    pub fn key_resolver(&self) -> Result<KeyResolver, ConfigError> {
        Ok(KeyResolver::new(
            self.ble.macos.infer_mac_address,
            self.mac_prefix()?,
        ))
    }
}

impl std::str::FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const FULL: &str = r#"
[ble]
vendor_prefix = "F0:CA"
local_name = "prst"

[ble.macos]
infer_mac_address = true
mac_address_prefix = "de:ad:be:ef"

[device.registry]
"F0:CA:F0:CA:0A:1E" = { name = "Monstera" }

[history]
capacity = 50

[dispatch]
policy = "bounded"
capacity = 8
timeout_ms = 250

[influxdb]
enabled = false
measurement = "plants"

[metrics]
enabled = true
textfile = "/tmp/parasite.prom"
expiry_secs = 60
refresh_secs = 5
"#;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = "".parse().unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.history.capacity, 1000);
        assert_eq!(config.dispatch.queue_policy(), QueuePolicy::Unbounded);
        assert!(config.influxdb.enabled);
        assert_eq!(config.influxdb.measurement, "parasite_measurement");
        assert!(!config.metrics.enabled);
        assert_eq!(config.mac_prefix().unwrap(), MacPrefix::default());
    }

    #[test]
    fn test_full_config() {
        let config: Config = FULL.parse().unwrap();
        assert_eq!(config.ble.local_name, "prst");
        assert!(config.ble.macos.infer_mac_address);
        assert_eq!(config.mac_prefix().unwrap().to_string(), "de:ad:be:ef");
        assert_eq!(config.history.capacity, 50);
        assert_eq!(
            config.dispatch.queue_policy(),
            QueuePolicy::Bounded {
                capacity: 8,
                timeout: Duration::from_millis(250)
            }
        );
        assert!(!config.influxdb.enabled);
        assert_eq!(config.influxdb.measurement, "plants");

        let options = config.metrics.options();
        assert_eq!(options.textfile, Some(PathBuf::from("/tmp/parasite.prom")));
        assert_eq!(options.expiry, Duration::from_secs(60));
        assert_eq!(options.refresh, Duration::from_secs(5));
    }

    #[test]
    fn test_registry_keys_are_lowercased() {
        let config: Config = FULL.parse().unwrap();
        let registry = config.device_registry();
        assert_eq!(registry.name("f0:ca:f0:ca:0a:1e"), Some("Monstera"));
    }

    #[test]
    fn test_empty_registry_name_rejected() {
        let err = r#"
[device.registry]
"aa:bb:cc:dd:ee:ff" = { name = " " }
"#
        .parse::<Config>()
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidRegistryEntry { ref key, .. } if key == "aa:bb:cc:dd:ee:ff"));
    }

    #[test]
    fn test_bad_mac_prefix_rejected() {
        let err = "[ble.macos]\nmac_address_prefix = \"f0:ca:f0\"\n"
            .parse::<Config>()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidMacPrefix { .. }));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = "[history]\ncapacty = 10\n".parse::<Config>().unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(FULL.as_bytes()).unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.history.capacity, 50);

        let missing = Config::load(Path::new("/nonexistent/parasite.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Read { .. }));
    }
}
