//! Device drivers hosted by instrument servers.
//!
//! A driver implements [`Device`]: a named set of attributes that can be read
//! and written, plus an explicit `close` that releases the hardware handle.
//! Drivers work in [`AttrValue`]s bound to the server's unit registry.
//!
//! Drivers are instantiated from configuration through a [`DriverCatalog`],
//! which maps a driver kind (`DeviceConfig::driver`) to a builder closure.
//!
//! # Available Drivers
//!
//! - `mock_signal_generator` - [`mock::MockSignalGenerator`]
//! - `mock_power_meter` - [`mock::MockPowerMeter`]

pub mod mock;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::DeviceConfig;
use crate::protocol::{AttributeInfo, RemoteErrorKind};
use crate::units::{Quantity, UnitError, UnitRegistry};
use crate::value::AttrValue;

/// Driver-level failures.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Unknown attribute '{0}'")]
    UnknownAttribute(String),

    #[error("Attribute '{0}' is read-only")]
    ReadOnly(String),

    #[error("Invalid value for '{attribute}': {reason}")]
    InvalidValue { attribute: String, reason: String },

    #[error("Hardware error: {0}")]
    Hardware(String),

    #[error("Unsupported driver kind: {0}")]
    UnknownDriver(String),

    #[error(transparent)]
    Unit(#[from] UnitError),
}

impl DeviceError {
    /// Classification reported to RPC clients.
    pub fn remote_kind(&self) -> RemoteErrorKind {
        match self {
            DeviceError::UnknownAttribute(_) => RemoteErrorKind::AttributeNotFound,
            DeviceError::ReadOnly(_) => RemoteErrorKind::ReadOnly,
            DeviceError::InvalidValue { .. } | DeviceError::Unit(_) => RemoteErrorKind::InvalidValue,
            DeviceError::Hardware(_) | DeviceError::UnknownDriver(_) => RemoteErrorKind::Driver,
        }
    }

    pub fn invalid(attribute: &str, reason: impl Into<String>) -> Self {
        DeviceError::InvalidValue {
            attribute: attribute.to_string(),
            reason: reason.into(),
        }
    }
}

/// One attached device.
///
/// The server serializes every call to a device, so methods take `&mut self`.
#[async_trait]
pub trait Device: Send {
    /// Attributes exposed over RPC.
    fn attributes(&self) -> Vec<AttributeInfo>;

    /// Bring the hardware into a known state after construction.
    async fn initialize(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    async fn get(&mut self, attribute: &str) -> Result<AttrValue, DeviceError>;

    async fn set(&mut self, attribute: &str, value: AttrValue) -> Result<(), DeviceError>;

    /// Release the hardware handle. Called exactly once per instance.
    async fn close(&mut self) -> Result<(), DeviceError>;
}

/// Everything a builder gets to construct a driver.
#[derive(Debug, Clone)]
pub struct DriverContext {
    /// Device id on this server.
    pub name: String,
    /// `settings` table of the device configuration.
    pub settings: toml::Table,
    /// The server's unit registry.
    pub units: Arc<UnitRegistry>,
}

impl DriverContext {
    pub fn bool_setting(&self, key: &str, default: bool) -> Result<bool, DeviceError> {
        match self.settings.get(key) {
            None => Ok(default),
            Some(toml::Value::Boolean(b)) => Ok(*b),
            Some(other) => Err(self.bad_setting(key, &format!("expected a boolean, got {other}"))),
        }
    }

    pub fn u64_setting(&self, key: &str, default: u64) -> Result<u64, DeviceError> {
        match self.settings.get(key) {
            None => Ok(default),
            Some(toml::Value::Integer(i)) if *i >= 0 => Ok(*i as u64),
            Some(other) => Err(self.bad_setting(key, &format!("expected a non-negative integer, got {other}"))),
        }
    }

    pub fn str_setting<'a>(&'a self, key: &str, default: &'a str) -> Result<&'a str, DeviceError> {
        match self.settings.get(key) {
            None => Ok(default),
            Some(toml::Value::String(s)) => Ok(s),
            Some(other) => Err(self.bad_setting(key, &format!("expected a string, got {other}"))),
        }
    }

    /// Quantity setting, converted to `unit`. Accepts `"1.5 V"` strings or bare
    /// numbers interpreted in `unit`.
    pub fn quantity_setting(&self, key: &str, default: &str, unit: &str) -> Result<Quantity, DeviceError> {
        let quantity = match self.settings.get(key) {
            None => self.units.parse_quantity(default)?,
            Some(toml::Value::String(s)) => self
                .units
                .parse_quantity(s)
                .map_err(|e| self.bad_setting(key, &e.to_string()))?,
            Some(toml::Value::Integer(i)) => self.units.quantity(*i as f64, unit)?,
            Some(toml::Value::Float(x)) => self.units.quantity(*x, unit)?,
            Some(other) => return Err(self.bad_setting(key, &format!("expected a quantity, got {other}"))),
        };
        quantity
            .to(&self.units, unit)
            .map_err(|e| self.bad_setting(key, &e.to_string()))
    }

    fn bad_setting(&self, key: &str, reason: &str) -> DeviceError {
        DeviceError::Hardware(format!("device '{}': setting '{key}': {reason}", self.name))
    }
}

type DeviceBuilder = Arc<dyn Fn(DriverContext) -> Result<Box<dyn Device>, DeviceError> + Send + Sync>;

/// Driver kind → builder.
#[derive(Clone, Default)]
pub struct DriverCatalog {
    builders: HashMap<String, DeviceBuilder>,
}

impl std::fmt::Debug for DriverCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverCatalog")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl DriverCatalog {
    pub fn new() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    /// Catalog with the mock drivers registered.
    pub fn with_builtin() -> Self {
        let mut catalog = Self::new();
        catalog.register_factory(
            mock::SIGNAL_GENERATOR,
            Arc::new(|ctx| mock::MockSignalGenerator::from_context(ctx).map(|d| Box::new(d) as Box<dyn Device>)),
        );
        catalog.register_factory(
            mock::POWER_METER,
            Arc::new(|ctx| mock::MockPowerMeter::from_context(ctx).map(|d| Box::new(d) as Box<dyn Device>)),
        );
        catalog
    }

    pub fn register_factory(&mut self, kind: impl Into<String>, builder: DeviceBuilder) {
        self.builders.insert(kind.into(), builder);
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.builders.contains_key(kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.builders.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Construct (but do not initialize) the driver for `config`.
    pub fn build(&self, config: &DeviceConfig, units: Arc<UnitRegistry>) -> Result<Box<dyn Device>, DeviceError> {
        let builder = self
            .builders
            .get(&config.driver)
            .ok_or_else(|| DeviceError::UnknownDriver(config.driver.clone()))?;
        builder(DriverContext {
            name: config.name.clone(),
            settings: config.settings.clone(),
            units,
        })
    }
}
