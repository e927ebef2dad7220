//! Configuration for instrument servers and instrument managers using Figment
//!
//! Both configurations are loaded from a TOML file and then overridden by
//! environment variables:
//!
//! - [`ServerConfig`]: `INSERV_` prefix (e.g. `INSERV_PORT=42070`)
//! - [`ClientConfig`]: `INSERV_CLIENT_` prefix
//!   (e.g. `INSERV_CLIENT_CONNECT_TIMEOUT_SECS=2.5`)
//!
//! Nested keys use a double underscore: `INSERV_REGISTRY__URL=redis://lab-db/0`.
//!
//! The registry is a redis server when `registry.url` is set and a shared
//! directory (`registry.path`) otherwise.
//!
//! # Example
//!
//! ```toml
//! name = "lab1"
//! port = 42068
//!
//! [registry]
//! url = "redis://lab-db:6379/0"
//!
//! [units]
//! furlong = "201.168 meter"
//!
//! [[devices]]
//! name = "sg"
//! driver = "mock_signal_generator"
//! settings = { amplitude = "1 V", latency_ms = 5 }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::units::UnitRegistry;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Environment prefix for server configuration overrides.
pub const SERVER_ENV_PREFIX: &str = "INSERV_";
/// Environment prefix for client configuration overrides.
pub const CLIENT_ENV_PREFIX: &str = "INSERV_CLIENT_";

/// URL schemes accepted for a networked registry.
pub const REGISTRY_URL_SCHEMES: &[&str] = &["redis://", "rediss://", "redis+unix://", "unix://"];

/// Upper bound for `connect_timeout_secs`.
pub const MAX_CONNECT_TIMEOUT_SECS: f64 = 3600.0;

/// Where and how servers are advertised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Connection descriptor of a redis registry, e.g. `redis://lab-db:6379/0`
    #[serde(default)]
    pub url: Option<String>,
    /// Root directory of a directory registry (may be a network mount);
    /// used when `url` is unset
    #[serde(default = "default_registry_path")]
    pub path: PathBuf,
    /// Container naming template; `{}` is replaced by the server id
    #[serde(default = "default_pattern")]
    pub pattern: String,
    /// Bound on every registry operation in milliseconds
    #[serde(default = "default_registry_timeout")]
    pub timeout_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            url: None,
            path: default_registry_path(),
            pattern: default_pattern(),
            timeout_ms: default_registry_timeout(),
        }
    }
}

impl RegistryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Point at the registry named by `descriptor`: a URL with one of
    /// [`REGISTRY_URL_SCHEMES`], or else a directory path.
    pub fn set_descriptor(&mut self, descriptor: &str) {
        if REGISTRY_URL_SCHEMES.iter().any(|scheme| descriptor.starts_with(scheme)) {
            self.url = Some(descriptor.to_string());
        } else {
            self.url = None;
            self.path = PathBuf::from(descriptor);
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(url) = &self.url {
            if !REGISTRY_URL_SCHEMES.iter().any(|scheme| url.starts_with(scheme)) {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid registry url '{url}'. Expected one of {}",
                    REGISTRY_URL_SCHEMES.join(", ")
                )));
            }
        }
        if self.pattern.matches("{}").count() != 1 {
            return Err(ConfigError::ValidationError(format!(
                "Invalid registry pattern '{}'. It must contain exactly one '{{}}'",
                self.pattern
            )));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "registry.timeout_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// One device hosted by an instrument server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device id, unique within the server
    pub name: String,
    /// Driver kind registered in the driver catalog
    pub driver: String,
    /// Disabled devices are skipped by bulk loads
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Driver-specific settings
    #[serde(default)]
    pub settings: toml::Table,
}

impl DeviceConfig {
    pub fn new(name: &str, driver: &str) -> Self {
        Self {
            name: name.to_string(),
            driver: driver.to_string(),
            enabled: true,
            settings: toml::Table::new(),
        }
    }

    /// Builder-style setting insertion.
    pub fn with_setting(mut self, key: &str, value: impl Into<toml::Value>) -> Self {
        self.settings.insert(key.to_string(), value.into());
        self
    }
}

/// Instrument server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server id advertised in the registry
    pub name: String,
    /// Bind address
    #[serde(default = "default_address")]
    pub address: String,
    /// Address clients should use; defaults to the bind address
    #[serde(default)]
    pub advertise_address: Option<String>,
    /// Endpoint port; 0 picks a free port
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub registry: RegistryConfig,
    /// Extra unit definitions, e.g. `furlong = "201.168 meter"`
    #[serde(default)]
    pub units: BTreeMap<String, String>,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// Instrument manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub registry: RegistryConfig,
    /// Bound on connection setup and on every call, in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: f64,
    /// Extra unit definitions for the local unit registry
    #[serde(default)]
    pub units: BTreeMap<String, String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            connect_timeout_secs: default_connect_timeout(),
            units: BTreeMap::new(),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_registry_path() -> PathBuf {
    std::env::temp_dir().join("inserv-registry")
}

fn default_pattern() -> String {
    "inserv_{}".to_string()
}

fn default_registry_timeout() -> u64 {
    2000
}

fn default_enabled() -> bool {
    true
}

fn default_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    42068
}

fn default_connect_timeout() -> f64 {
    10.0
}

// ============================================================================
// Loading and Validation
// ============================================================================

fn build_unit_registry(definitions: &BTreeMap<String, String>) -> Result<UnitRegistry, ConfigError> {
    let mut units = UnitRegistry::new();
    for (name, definition) in definitions {
        units
            .define(name, definition)
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
    }
    Ok(units)
}

impl ServerConfig {
    /// Minimal configuration with no devices.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            address: default_address(),
            advertise_address: None,
            port: default_port(),
            registry: RegistryConfig::default(),
            units: BTreeMap::new(),
            devices: Vec::new(),
        }
    }

    /// Load configuration from a TOML file and `INSERV_` environment variables
    ///
    /// Environment variables take precedence over the file. The result is
    /// validated before it is returned.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::extract(Figment::new().merge(Toml::file(path.as_ref())))
    }

    /// Like [`ServerConfig::load_from`] but from an in-memory TOML document.
    pub fn from_toml_str(document: &str) -> Result<Self, ConfigError> {
        Self::extract(Figment::new().merge(Toml::string(document)))
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment
            .merge(Env::prefixed(SERVER_ENV_PREFIX).split("__"))
            .extract()
            .map_err(ConfigError::LoadError)?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Server and device names are non-empty and contain no '/'
    /// - Device names are unique
    /// - Registry pattern has exactly one placeholder and a positive timeout
    /// - Extra unit definitions resolve
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_id("server name", &self.name)?;
        self.registry.validate()?;

        let mut names = HashSet::new();
        for device in &self.devices {
            validate_id("device name", &device.name)?;
            if device.driver.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "Device '{}': 'driver' cannot be empty",
                    device.name
                )));
            }
            if !names.insert(device.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate device name: '{}'",
                    device.name
                )));
            }
        }

        build_unit_registry(&self.units).map(|_| ())
    }

    /// Server-side unit registry including the configured extra units.
    pub fn unit_registry(&self) -> Result<UnitRegistry, ConfigError> {
        build_unit_registry(&self.units)
    }

    /// Configuration entry of one device.
    pub fn device(&self, name: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.name == name)
    }

    /// Get all enabled devices
    pub fn enabled_devices(&self) -> impl Iterator<Item = &DeviceConfig> {
        self.devices.iter().filter(|d| d.enabled)
    }

    /// `address:port` the endpoint binds to.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Address written to the registry.
    pub fn advertised_address(&self) -> String {
        match &self.advertise_address {
            Some(address) => address.clone(),
            None if self.address == "0.0.0.0" || self.address == "::" => "127.0.0.1".to_string(),
            None => self.address.clone(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from a TOML file (optional) and `INSERV_CLIENT_`
    /// environment variables.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(CLIENT_ENV_PREFIX).split("__"))
            .extract()
            .map_err(ConfigError::LoadError)?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.registry.validate()?;
        if !(self.connect_timeout_secs > 0.0 && self.connect_timeout_secs <= MAX_CONNECT_TIMEOUT_SECS) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid connect_timeout_secs {}. Must be > 0 and at most {MAX_CONNECT_TIMEOUT_SECS}",
                self.connect_timeout_secs
            )));
        }
        build_unit_registry(&self.units).map(|_| ())
    }

    /// `connect_timeout_secs` as a duration, clamped to
    /// [`MAX_CONNECT_TIMEOUT_SECS`].
    pub fn connect_timeout(&self) -> Duration {
        let max = Duration::from_secs_f64(MAX_CONNECT_TIMEOUT_SECS);
        Duration::try_from_secs_f64(self.connect_timeout_secs).map_or(max, |timeout| timeout.min(max))
    }

    /// Client-side unit registry including the configured extra units.
    pub fn unit_registry(&self) -> Result<UnitRegistry, ConfigError> {
        build_unit_registry(&self.units)
    }
}

fn validate_id(what: &str, id: &str) -> Result<(), ConfigError> {
    if id.trim().is_empty() {
        return Err(ConfigError::ValidationError(format!("{what} cannot be empty")));
    }
    if id.contains('/') {
        return Err(ConfigError::ValidationError(format!(
            "Invalid {what} '{id}': '/' is reserved as the server/device separator"
        )));
    }
    Ok(())
}
