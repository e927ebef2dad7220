//! Shared harness for the integration tests: a temporary registry, in-process
//! instrument servers on ephemeral ports and an instrumented probe driver.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use rust_inserv::config::{ClientConfig, DeviceConfig, RegistryConfig, ServerConfig};
use rust_inserv::drivers::{Device, DeviceError, DriverCatalog, DriverContext};
use rust_inserv::manager::InstrumentManager;
use rust_inserv::protocol::AttributeInfo;
use rust_inserv::registry::RegistryClient;
use rust_inserv::server::InstrumentServer;
use rust_inserv::units::UnitRegistry;
use rust_inserv::value::AttrValue;

/// Driver kind of [`ProbeDevice`].
pub const PROBE: &str = "probe";

/// One completed `get` on a probe device.
#[derive(Debug, Clone)]
pub struct Span {
    pub device: String,
    pub enter: Instant,
    pub exit: Instant,
}

impl Span {
    pub fn overlaps(&self, other: &Span) -> bool {
        self.enter < other.exit && other.enter < self.exit
    }
}

/// Observations shared by every probe built from one catalog.
#[derive(Debug, Default)]
pub struct ProbeLog {
    spans: Mutex<Vec<Span>>,
    closes: Mutex<HashMap<String, usize>>,
}

impl ProbeLog {
    pub fn spans(&self) -> Vec<Span> {
        self.spans.lock().clone()
    }

    pub fn spans_of(&self, device: &str) -> Vec<Span> {
        self.spans().into_iter().filter(|s| s.device == device).collect()
    }

    pub fn closes(&self, device: &str) -> usize {
        self.closes.lock().get(device).copied().unwrap_or(0)
    }
}

/// Driver whose reads take `delay_ms` and report in the configured `unit`.
///
/// Attributes:
/// - `value` (read-write) quantity in `unit`, initially 1
/// - `slow` (read-only) like `value` but takes `slow_ms`
///
/// `init_ms` delays `initialize`; `fail_on_init` makes it fail afterwards.
pub struct ProbeDevice {
    name: String,
    units: Arc<UnitRegistry>,
    unit: String,
    value: f64,
    delay: Duration,
    slow: Duration,
    init: Duration,
    fail_on_init: bool,
    log: Arc<ProbeLog>,
}

impl ProbeDevice {
    async fn read(&self, delay: Duration) -> Result<AttrValue, DeviceError> {
        let enter = Instant::now();
        tokio::time::sleep(delay).await;
        let value = self.units.quantity(self.value, &self.unit)?;
        self.log.spans.lock().push(Span {
            device: self.name.clone(),
            enter,
            exit: Instant::now(),
        });
        Ok(AttrValue::Quantity(value))
    }
}

#[async_trait]
impl Device for ProbeDevice {
    fn attributes(&self) -> Vec<AttributeInfo> {
        vec![
            AttributeInfo::read_write("value", Some(self.unit.as_str())),
            AttributeInfo::read_only("slow", Some(self.unit.as_str())),
        ]
    }

    async fn initialize(&mut self) -> Result<(), DeviceError> {
        tokio::time::sleep(self.init).await;
        if self.fail_on_init {
            return Err(DeviceError::Hardware("probe failed to initialize".to_string()));
        }
        Ok(())
    }

    async fn get(&mut self, attribute: &str) -> Result<AttrValue, DeviceError> {
        match attribute {
            "value" => self.read(self.delay).await,
            "slow" => self.read(self.slow).await,
            other => Err(DeviceError::UnknownAttribute(other.to_string())),
        }
    }

    async fn set(&mut self, attribute: &str, value: AttrValue) -> Result<(), DeviceError> {
        match attribute {
            "value" => {
                let quantity = match value {
                    AttrValue::Quantity(q) => q.to(&self.units, &self.unit)?,
                    other => return Err(DeviceError::invalid("value", format!("got {}", other.kind()))),
                };
                self.value = quantity.magnitude();
                Ok(())
            }
            "slow" => Err(DeviceError::ReadOnly("slow".to_string())),
            other => Err(DeviceError::UnknownAttribute(other.to_string())),
        }
    }

    async fn close(&mut self) -> Result<(), DeviceError> {
        *self.log.closes.lock().entry(self.name.clone()).or_insert(0) += 1;
        Ok(())
    }
}

/// Builtin drivers plus [`PROBE`] reporting into `log`.
pub fn catalog(log: Arc<ProbeLog>) -> DriverCatalog {
    let mut catalog = DriverCatalog::with_builtin();
    catalog.register_factory(
        PROBE,
        Arc::new(move |ctx: DriverContext| -> Result<Box<dyn Device>, DeviceError> {
            if ctx.bool_setting("fail_on_load", false)? {
                return Err(DeviceError::Hardware("probe refused to load".to_string()));
            }
            Ok(Box::new(ProbeDevice {
                unit: ctx.str_setting("unit", "volt")?.to_string(),
                delay: Duration::from_millis(ctx.u64_setting("delay_ms", 0)?),
                slow: Duration::from_millis(ctx.u64_setting("slow_ms", 5_000)?),
                init: Duration::from_millis(ctx.u64_setting("init_ms", 0)?),
                fail_on_init: ctx.bool_setting("fail_on_init", false)?,
                name: ctx.name,
                units: ctx.units,
                value: 1.0,
                log: log.clone(),
            }))
        }),
    );
    catalog
}

pub fn probe(name: &str) -> DeviceConfig {
    DeviceConfig::new(name, PROBE)
}

pub fn registry_config(root: &Path) -> RegistryConfig {
    RegistryConfig {
        path: root.to_path_buf(),
        ..RegistryConfig::default()
    }
}

/// Loopback server configuration on an ephemeral port.
pub fn server_config(name: &str, root: &Path, devices: Vec<DeviceConfig>) -> ServerConfig {
    let mut config = ServerConfig::new(name);
    config.address = "127.0.0.1".to_string();
    config.port = 0;
    config.registry = registry_config(root);
    config.devices = devices;
    config
}

/// Build a server, load its devices and start its endpoint.
pub async fn start_server(config: ServerConfig, log: Arc<ProbeLog>) -> InstrumentServer {
    let registry = RegistryClient::from_config(&config.registry).expect("registry client");
    let mut server = InstrumentServer::new(config, catalog(log), registry).expect("valid server config");
    server.startup().await.expect("endpoint starts");
    server
}

pub fn client_config(root: &Path) -> ClientConfig {
    ClientConfig {
        registry: registry_config(root),
        connect_timeout_secs: 2.0,
        ..ClientConfig::default()
    }
}

/// Manager that has discovered, connected and loaded every advertised server.
pub async fn manager(root: &Path) -> InstrumentManager {
    InstrumentManager::from_config(&client_config(root))
        .await
        .expect("manager starts")
}
