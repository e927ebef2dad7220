//! Instrument server core.
//!
//! [`InstrumentServer`] owns the loaded configuration, the local device set and
//! the RPC endpoint. Device lifecycle (load, reload, delete) and endpoint
//! lifecycle (start, stop, restart) are independent: stopping the endpoint
//! leaves devices attached, and reloading devices never touches client
//! connections.
//!
//! ## Endpoint states
//!
//! ```text
//! Stopped ──start_server──▶ Starting ──▶ Running ──stop_server──▶ Stopping ──▶ Stopped
//! ```
//!
//! `start_server` is only valid from `Stopped`; `stop_server` is a no-op when
//! already stopped.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::join_all;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::devices::DeviceSet;
use super::endpoint::{self, EndpointContext};
use crate::config::{ConfigError, DeviceConfig, ServerConfig};
use crate::drivers::DriverCatalog;
use crate::error::{InservError, InservResult};
use crate::registry::{RegistryClient, ServerSettings};
use crate::units::UnitRegistry;

/// Lifecycle state of the RPC endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl std::fmt::Display for EndpointState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EndpointState::Stopped => "stopped",
            EndpointState::Starting => "starting",
            EndpointState::Running => "running",
            EndpointState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

struct RunningEndpoint {
    local_addr: SocketAddr,
    advertised_as: String,
    registry: RegistryClient,
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// An instrument server process.
pub struct InstrumentServer {
    config_path: Option<PathBuf>,
    config: ServerConfig,
    units: Arc<UnitRegistry>,
    catalog: DriverCatalog,
    registry: RegistryClient,
    /// Registry descriptor given on the command line; wins over every
    /// configuration reload.
    registry_override: Option<String>,
    devices: Arc<DeviceSet>,
    state: EndpointState,
    running: Option<RunningEndpoint>,
}

impl std::fmt::Debug for InstrumentServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentServer")
            .field("name", &self.config.name)
            .field("state", &self.state)
            .field("devices", &self.devices)
            .finish_non_exhaustive()
    }
}

impl InstrumentServer {
    /// Server with an explicit configuration and registry handle.
    ///
    /// Nothing is loaded or started; see [`InstrumentServer::startup`].
    pub fn new(config: ServerConfig, catalog: DriverCatalog, registry: RegistryClient) -> InservResult<Self> {
        config.validate()?;
        let units = Arc::new(config.unit_registry()?);
        Ok(Self {
            config_path: None,
            config,
            units,
            catalog,
            registry,
            registry_override: None,
            devices: Arc::new(DeviceSet::new()),
            state: EndpointState::Stopped,
            running: None,
        })
    }

    /// Server configured from a TOML file; the registry handle is built from
    /// the `[registry]` section.
    pub fn from_path(path: &Path, catalog: DriverCatalog) -> InservResult<Self> {
        let config = ServerConfig::load_from(path)?;
        let registry = RegistryClient::from_config(&config.registry)?;
        let mut server = Self::new(config, catalog, registry)?;
        server.config_path = Some(path.to_path_buf());
        Ok(server)
    }

    /// Use the registry named by `descriptor` (a redis URL or a directory)
    /// instead of the configured one, now and after every configuration
    /// reload. Takes effect at the next `start_server`.
    pub fn override_registry(&mut self, descriptor: &str) -> InservResult<()> {
        let mut registry = self.config.registry.clone();
        registry.set_descriptor(descriptor);
        self.registry = RegistryClient::from_config(&registry)?;
        self.config.registry = registry;
        self.registry_override = Some(descriptor.to_string());
        info!(registry = %self.registry.location(), "Registry overridden");
        Ok(())
    }

    // =========================================================================
    // Devices
    // =========================================================================

    /// Instantiate (or re-instantiate) one device.
    pub async fn load_device(&self, config: &DeviceConfig) -> InservResult<()> {
        self.devices
            .load(config, &self.catalog, self.units.clone())
            .await
    }

    /// Reload a configured device by name.
    pub async fn reload_device(&self, name: &str) -> InservResult<()> {
        let Some(config) = self.config.device(name) else {
            return Err(InservError::DeviceLoad {
                device: name.to_string(),
                reason: "no configuration entry for this device".to_string(),
            });
        };
        self.load_device(config).await
    }

    /// Reload every enabled device; detach devices that are no longer
    /// configured (or disabled).
    ///
    /// All devices are attempted; failures are returned together as
    /// [`InservError::DeviceLoadFailures`].
    pub async fn reload_all_devices(&self) -> InservResult<()> {
        for name in self.devices.names() {
            let wanted = self.config.device(&name).is_some_and(|d| d.enabled);
            if !wanted {
                info!(device = %name, "Device no longer configured; deleting");
                self.devices.delete(&name).await;
            }
        }

        let results = join_all(self.config.enabled_devices().map(|d| self.load_device(d))).await;
        let failures: Vec<InservError> = results.into_iter().filter_map(Result::err).collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(InservError::DeviceLoadFailures(failures))
        }
    }

    /// Close and detach a device; absent devices are a logged no-op.
    pub async fn delete_device(&self, name: &str) {
        if !self.devices.delete(name).await {
            info!(device = name, "Device not attached; nothing to delete");
        }
    }

    /// Close and detach every device.
    pub async fn delete_all_devices(&self) -> Vec<String> {
        self.devices.delete_all().await
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Re-read configuration from `path`, or from the current path.
    ///
    /// Neither devices nor connections are touched. Endpoint address changes
    /// apply at the next `start_server`; device changes at the next reload.
    /// Unit definitions are fixed for the lifetime of the server.
    pub async fn update_config(&mut self, path: Option<&Path>) -> InservResult<()> {
        let path = match path.map(Path::to_path_buf).or_else(|| self.config_path.clone()) {
            Some(path) => path,
            None => {
                return Err(ConfigError::ValidationError(
                    "no configuration file to reload from".to_string(),
                )
                .into())
            }
        };

        let mut config = ServerConfig::load_from(&path)?;
        if let Some(descriptor) = &self.registry_override {
            config.registry.set_descriptor(descriptor);
        }
        if config.units != self.config.units {
            warn!("Unit definitions changed; they take effect after a process restart");
        }
        if config.registry != self.config.registry {
            self.registry = RegistryClient::from_config(&config.registry)?;
        }

        info!(path = %path.display(), devices = config.devices.len(), "Configuration reloaded");
        self.config = config;
        self.config_path = Some(path);
        Ok(())
    }

    // =========================================================================
    // Endpoint
    // =========================================================================

    /// Bind, start accepting and advertise the server in the registry.
    pub async fn start_server(&mut self) -> InservResult<SocketAddr> {
        if self.state != EndpointState::Stopped {
            return Err(InservError::Endpoint(format!(
                "cannot start the endpoint while it is {}",
                self.state
            )));
        }
        self.state = EndpointState::Starting;

        let bind = self.config.bind_address();
        let listener = match TcpListener::bind(&bind).await {
            Ok(listener) => listener,
            Err(e) => {
                self.state = EndpointState::Stopped;
                return Err(InservError::Endpoint(format!("cannot bind {bind}: {e}")));
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                self.state = EndpointState::Stopped;
                return Err(e.into());
            }
        };

        let token = CancellationToken::new();
        let context = Arc::new(EndpointContext {
            server_name: self.config.name.clone(),
            devices: self.devices.clone(),
            units: self.units.clone(),
        });
        let task = tokio::spawn(endpoint::serve(listener, context, token.clone()));

        let settings = ServerSettings {
            address: self.config.advertised_address(),
            port: local_addr.port(),
        };
        if let Err(e) = self.registry.advertise(&self.config.name, &settings).await {
            token.cancel();
            if let Err(join_err) = task.await {
                warn!(error = %join_err, "Endpoint task failed");
            }
            self.state = EndpointState::Stopped;
            return Err(e.into());
        }

        self.running = Some(RunningEndpoint {
            local_addr,
            advertised_as: self.config.name.clone(),
            registry: self.registry.clone(),
            token,
            task,
        });
        self.state = EndpointState::Running;
        info!(server = %self.config.name, %local_addr, "Endpoint running");
        Ok(local_addr)
    }

    /// Withdraw from the registry, stop accepting and close every client
    /// connection once its in-flight call has returned. No-op when already
    /// stopped.
    pub async fn stop_server(&mut self) -> InservResult<()> {
        let Some(running) = self.running.take() else {
            info!("Endpoint already stopped");
            return Ok(());
        };
        self.state = EndpointState::Stopping;

        let withdrawn = running.registry.withdraw(&running.advertised_as).await;
        if let Err(e) = &withdrawn {
            warn!(error = %e, "Failed to withdraw registry entry");
        }

        running.token.cancel();
        if let Err(e) = running.task.await {
            error!(error = %e, "Endpoint task failed");
        }
        self.state = EndpointState::Stopped;
        info!(server = %running.advertised_as, "Endpoint stopped");

        withdrawn.map_err(InservError::from)
    }

    /// `stop_server` followed by `start_server`.
    pub async fn restart_server(&mut self) -> InservResult<SocketAddr> {
        match self.state {
            EndpointState::Stopped | EndpointState::Running => {}
            other => {
                return Err(InservError::Endpoint(format!(
                    "cannot restart the endpoint while it is {other}"
                )))
            }
        }
        if let Err(e) = self.stop_server().await {
            warn!(error = %e, "Endpoint stopped with errors");
        }
        self.start_server().await
    }

    /// Reload configuration and devices, then restart the endpoint.
    ///
    /// The endpoint restart is attempted even if devices failed to load; in
    /// that case the device failures are returned afterwards. A configuration
    /// that fails to load aborts the restart and keeps everything as it was.
    pub async fn restart(&mut self) -> InservResult<()> {
        self.update_config(None).await?;
        let devices = self.reload_all_devices().await;
        let endpoint = self.restart_server().await;

        match (devices, endpoint) {
            (_, Err(endpoint_err)) => Err(endpoint_err),
            (Err(device_err), Ok(_)) => Err(device_err),
            (Ok(()), Ok(_)) => Ok(()),
        }
    }

    /// Load every configured device (failures are logged) and start the
    /// endpoint (failure is returned).
    pub async fn startup(&mut self) -> InservResult<SocketAddr> {
        if let Err(e) = self.reload_all_devices().await {
            warn!(error = %e, "Some devices failed to load");
        }
        self.start_server().await
    }

    /// Stop the endpoint and release every device. Safe to call repeatedly.
    pub async fn shutdown(&mut self) -> InservResult<()> {
        let stopped = self.stop_server().await;
        let deleted = self.delete_all_devices().await;
        info!(devices = deleted.len(), "Server shut down");
        stopped
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    pub fn endpoint_state(&self) -> EndpointState {
        self.state
    }

    /// Bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    pub fn device_names(&self) -> Vec<String> {
        self.devices.names()
    }

    pub fn devices(&self) -> &Arc<DeviceSet> {
        &self.devices
    }

    pub fn units(&self) -> &Arc<UnitRegistry> {
        &self.units
    }

    pub fn catalog(&self) -> &DriverCatalog {
        &self.catalog
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::mock;
    use crate::registry::{MemoryRegistry, ServerNamePattern};

    fn server(devices: Vec<DeviceConfig>) -> (InstrumentServer, RegistryClient) {
        let registry = RegistryClient::new(
            Arc::new(MemoryRegistry::new()),
            ServerNamePattern::new("inserv_{}").unwrap(),
        );
        let mut config = ServerConfig::new("lab1");
        config.address = "127.0.0.1".into();
        config.port = 0;
        config.devices = devices;
        let server = InstrumentServer::new(config, DriverCatalog::with_builtin(), registry.clone()).unwrap();
        (server, registry)
    }

    #[tokio::test]
    async fn endpoint_lifecycle() {
        let (mut server, registry) = server(vec![]);
        assert_eq!(server.endpoint_state(), EndpointState::Stopped);

        let addr = server.start_server().await.unwrap();
        assert_eq!(server.endpoint_state(), EndpointState::Running);
        let entries = registry.discover().await.unwrap();
        assert_eq!(entries[0].port, addr.port());

        assert!(matches!(server.start_server().await, Err(InservError::Endpoint(_))));

        server.stop_server().await.unwrap();
        assert_eq!(server.endpoint_state(), EndpointState::Stopped);
        assert!(registry.discover().await.unwrap().is_empty());
        server.stop_server().await.unwrap();

        server.restart_server().await.unwrap();
        assert_eq!(server.endpoint_state(), EndpointState::Running);
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn reload_unconfigured_device_fails() {
        let (server, _) = server(vec![]);
        assert!(matches!(
            server.reload_device("sg").await,
            Err(InservError::DeviceLoad { device, .. }) if device == "sg"
        ));
    }

    #[tokio::test]
    async fn reload_all_drops_unconfigured_devices() {
        let (server, _) = server(vec![DeviceConfig::new("sg", mock::SIGNAL_GENERATOR)]);
        server
            .load_device(&DeviceConfig::new("extra", mock::POWER_METER))
            .await
            .unwrap();

        server.reload_all_devices().await.unwrap();
        assert_eq!(server.device_names(), ["sg"]);
    }

    #[tokio::test]
    async fn delete_absent_device_is_noop() {
        let (server, _) = server(vec![]);
        server.delete_device("ghost").await;
        assert!(server.device_names().is_empty());
    }

    #[tokio::test]
    async fn registry_override_survives_config_reload() {
        let configured = tempfile::tempdir().unwrap();
        let overridden = tempfile::tempdir().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inserv.toml");
        std::fs::write(
            &path,
            format!(
                "name = \"lab1\"\naddress = \"127.0.0.1\"\nport = 0\n\n[registry]\npath = {:?}\n",
                configured.path().display().to_string()
            ),
        )
        .unwrap();

        let mut server = InstrumentServer::from_path(&path, DriverCatalog::with_builtin()).unwrap();
        server.override_registry(&overridden.path().display().to_string()).unwrap();
        server.update_config(None).await.unwrap();
        assert_eq!(server.config().registry.path, overridden.path());

        server.start_server().await.unwrap();
        let client = |root: &Path| {
            let mut config = crate::config::RegistryConfig::default();
            config.path = root.to_path_buf();
            RegistryClient::from_config(&config).unwrap()
        };
        assert_eq!(client(overridden.path()).discover().await.unwrap().len(), 1);
        assert!(client(configured.path()).discover().await.unwrap().is_empty());
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn update_config_without_path() {
        let (mut server, _) = server(vec![]);
        assert!(matches!(server.update_config(None).await, Err(InservError::Config(_))));
    }
}
