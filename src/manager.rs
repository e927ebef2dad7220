//! Client-side instrument manager.
//!
//! `InstrumentManager` discovers instrument servers through the service
//! registry, keeps one RPC channel per server and exposes every remote device
//! under a flat `"<server_id>/<device_id>"` namespace.
//!
//! ## Connection lifecycle
//!
//! ```text
//! (unknown) ──connect──▶ Connecting ──ok──▶ Connected ──disconnect──▶ Disconnecting ──▶ (unknown)
//!                             │
//!                             └──error──▶ Failed
//! ```
//!
//! Only `Connected` servers are present in the connection map; a failed
//! connect never leaves a map entry behind. `Failed` states of servers that
//! are no longer advertised are forgotten on the next reconcile. All
//! lifecycle operations take `&mut self` and therefore run one at a time.
//!
//! Channels are opened through a [`Connector`]; [`TcpConnector`] is the
//! default.
//!
//! ## Device table
//!
//! [`InstrumentManager::load_devices`] rebuilds the device table from scratch
//! on every call. Disconnecting a server removes its devices immediately.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::device_table::{qualified_id, DeviceTable};
use crate::error::{InservError, InservResult};
use crate::proxy::{DeviceProxy, RemoteDevice};
use crate::registry::RegistryClient;
use crate::rpc::{RpcChannel, RpcClient};
use crate::units::UnitRegistry;

/// Default bound on connection setup and calls.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens RPC channels to instrument servers.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a channel and complete its handshake within `timeout`.
    async fn connect(
        &self,
        server_id: &str,
        address: &str,
        port: u16,
        timeout: Duration,
    ) -> InservResult<Arc<dyn RpcChannel>>;
}

/// TCP channels through [`RpcClient::connect`].
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        server_id: &str,
        address: &str,
        port: u16,
        timeout: Duration,
    ) -> InservResult<Arc<dyn RpcChannel>> {
        let client = RpcClient::connect(server_id, address, port, timeout).await?;
        Ok(Arc::new(client))
    }
}

/// Lifecycle state of a server as seen by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnecting,
    Failed,
}

/// Live connection to one instrument server.
pub struct ServerConnection {
    pub server_id: String,
    pub address: String,
    pub port: u16,
    pub channel: Arc<dyn RpcChannel>,
    /// Device ids reported by the last `load_devices`.
    pub devices: Vec<String>,
}

impl std::fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConnection")
            .field("server_id", &self.server_id)
            .field("address", &self.address)
            .field("port", &self.port)
            .field("devices", &self.devices)
            .finish_non_exhaustive()
    }
}

/// Outcome of [`InstrumentManager::rediscover_and_connect`].
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Newly connected servers.
    pub connected: Vec<String>,
    /// Servers reconnected because their endpoint changed or the channel was stale.
    pub reconnected: Vec<String>,
    /// Healthy servers left untouched.
    pub retained: Vec<String>,
    /// Servers no longer advertised and therefore disconnected.
    pub dropped: Vec<String>,
    /// Per-server connection failures.
    pub failures: Vec<(String, InservError)>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Outcome of [`InstrumentManager::load_devices`].
#[derive(Debug, Default)]
pub struct DeviceLoadReport {
    /// Qualified ids now in the device table, sorted.
    pub devices: Vec<String>,
    /// Servers whose device enumeration failed.
    pub failures: Vec<(String, InservError)>,
}

/// Aggregates the devices of every advertised instrument server.
pub struct InstrumentManager {
    registry: RegistryClient,
    connector: Arc<dyn Connector>,
    units: Arc<UnitRegistry>,
    connect_timeout: Duration,
    servers: BTreeMap<String, ServerConnection>,
    states: HashMap<String, ConnectionState>,
    devices: DeviceTable,
}

impl std::fmt::Debug for InstrumentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentManager")
            .field("registry", &self.registry)
            .field("servers", &self.servers.keys().collect::<Vec<_>>())
            .field("devices", &self.devices)
            .finish_non_exhaustive()
    }
}

impl InstrumentManager {
    /// Manager with no connections.
    pub fn new(registry: RegistryClient, units: Arc<UnitRegistry>, connect_timeout: Duration) -> Self {
        Self {
            registry,
            connector: Arc::new(TcpConnector),
            units,
            connect_timeout,
            servers: BTreeMap::new(),
            states: HashMap::new(),
            devices: DeviceTable::new(),
        }
    }

    /// Replace the way channels are opened.
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    /// Build from configuration, then discover, connect and load devices.
    ///
    /// An unreachable registry is fatal; individual servers that cannot be
    /// reached are logged and skipped.
    pub async fn from_config(config: &ClientConfig) -> InservResult<Self> {
        let units = Arc::new(config.unit_registry()?);
        let registry = RegistryClient::from_config(&config.registry)?;
        let mut manager = Self::new(registry, units, config.connect_timeout());

        let report = manager.rediscover_and_connect().await?;
        for (server_id, error) in &report.failures {
            warn!(server_id = %server_id, error = %error, "Server unavailable at startup");
        }
        let loaded = manager.load_devices().await;
        for (server_id, error) in &loaded.failures {
            warn!(server_id = %server_id, error = %error, "Failed to enumerate devices");
        }
        info!(
            servers = manager.servers.len(),
            devices = loaded.devices.len(),
            "Instrument manager ready"
        );
        Ok(manager)
    }

    // =========================================================================
    // Connections
    // =========================================================================

    /// Open a channel to `server_id` at `address:port`.
    ///
    /// On failure the connection map is left exactly as it was. If the server
    /// was already connected, its old channel is closed and replaced once the
    /// new one is up, and its devices leave the device table until the next
    /// [`InstrumentManager::load_devices`].
    pub async fn connect(&mut self, server_id: &str, address: &str, port: u16) -> InservResult<()> {
        debug!(server_id, address, port, "Connecting");
        self.states
            .insert(server_id.to_string(), ConnectionState::Connecting);

        let channel = match self
            .connector
            .connect(server_id, address, port, self.connect_timeout)
            .await
        {
            Ok(channel) => channel,
            Err(e) => {
                warn!(server_id, error = %e, "Connect failed");
                let state = if self.servers.contains_key(server_id) {
                    ConnectionState::Connected
                } else {
                    ConnectionState::Failed
                };
                self.states.insert(server_id.to_string(), state);
                return Err(e);
            }
        };

        let connection = ServerConnection {
            server_id: server_id.to_string(),
            address: address.to_string(),
            port,
            channel,
            devices: Vec::new(),
        };
        if let Some(previous) = self.servers.insert(server_id.to_string(), connection) {
            self.devices.remove_server(server_id);
            if let Err(e) = previous.channel.close().await {
                debug!(server_id, error = %e, "Error closing replaced channel");
            }
        }
        self.states
            .insert(server_id.to_string(), ConnectionState::Connected);
        info!(server_id, address, port, "Connected");
        Ok(())
    }

    /// Close the channel of `server_id` and drop its devices.
    pub async fn disconnect(&mut self, server_id: &str) -> InservResult<()> {
        let Some(connection) = self.servers.remove(server_id) else {
            return Err(InservError::NotConnected {
                server_id: server_id.to_string(),
            });
        };
        self.states
            .insert(server_id.to_string(), ConnectionState::Disconnecting);

        let removed = self.devices.remove_server(server_id);
        let closed = connection.channel.close().await;
        self.states.remove(server_id);

        info!(server_id, devices = removed, "Disconnected");
        closed
    }

    /// Disconnect every server. Failures are logged and the loop continues;
    /// the first failure is returned once all servers were attempted.
    pub async fn disconnect_all(&mut self) -> InservResult<()> {
        let ids: Vec<String> = self.servers.keys().cloned().collect();
        let mut first_error = None;

        for server_id in ids {
            if let Err(e) = self.disconnect(&server_id).await {
                warn!(server_id = %server_id, error = %e, "Disconnect failed");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Discover servers and reconcile the connection map with the registry.
    ///
    /// - connected servers no longer advertised are disconnected
    /// - servers advertised at a new endpoint are reconnected
    /// - servers at the same endpoint are pinged and reconnected only if stale
    /// - newly advertised servers are connected
    ///
    /// A discovery failure aborts the pass before anything changes.
    pub async fn rediscover_and_connect(&mut self) -> InservResult<ReconcileReport> {
        let entries = self
            .registry
            .discover()
            .await
            .map_err(|source| InservError::Discovery {
                location: self.registry.location(),
                source,
            })?;
        let mut report = ReconcileReport::default();

        let withdrawn: Vec<String> = self
            .servers
            .keys()
            .filter(|id| !entries.iter().any(|entry| &entry.server_id == *id))
            .cloned()
            .collect();
        for server_id in withdrawn {
            if let Err(e) = self.disconnect(&server_id).await {
                warn!(server_id = %server_id, error = %e, "Error closing withdrawn server");
            }
            report.dropped.push(server_id);
        }

        for entry in &entries {
            let server_id = entry.server_id.as_str();
            let existing = match self.servers.get(server_id) {
                None => false,
                Some(conn) if conn.address == entry.address && conn.port == entry.port => {
                    match conn.channel.ping().await {
                        Ok(_) => {
                            report.retained.push(server_id.to_string());
                            continue;
                        }
                        Err(e) => {
                            warn!(server_id, error = %e, "Channel stale, reconnecting");
                            true
                        }
                    }
                }
                Some(conn) => {
                    info!(
                        server_id,
                        old = %format!("{}:{}", conn.address, conn.port),
                        new = %entry.endpoint(),
                        "Server endpoint changed, reconnecting"
                    );
                    true
                }
            };

            match self.connect(server_id, &entry.address, entry.port).await {
                Ok(()) if existing => report.reconnected.push(server_id.to_string()),
                Ok(()) => report.connected.push(server_id.to_string()),
                Err(e) => {
                    if existing {
                        // The old endpoint is no longer advertised or no longer answers.
                        if let Err(close_err) = self.disconnect(server_id).await {
                            warn!(server_id, error = %close_err, "Error closing stale channel");
                        }
                        self.states
                            .insert(server_id.to_string(), ConnectionState::Failed);
                    }
                    report.failures.push((server_id.to_string(), e));
                }
            }
        }

        let advertised: HashSet<&str> = entries.iter().map(|e| e.server_id.as_str()).collect();
        self.states.retain(|server_id, state| {
            *state != ConnectionState::Failed || advertised.contains(server_id.as_str())
        });

        Ok(report)
    }

    // =========================================================================
    // Devices
    // =========================================================================

    /// Rebuild the device table from every connected server.
    ///
    /// A server whose enumeration fails contributes no devices; its failure is
    /// reported and the remaining servers are still loaded.
    pub async fn load_devices(&mut self) -> DeviceLoadReport {
        let mut table = DeviceTable::new();
        let mut report = DeviceLoadReport::default();

        for (server_id, connection) in self.servers.iter_mut() {
            match connection.channel.list_devices().await {
                Ok(device_ids) => {
                    for device_id in &device_ids {
                        let proxy = DeviceProxy::new(
                            server_id,
                            device_id,
                            connection.channel.clone(),
                            self.units.clone(),
                        );
                        table.insert(Arc::new(proxy));
                    }
                    debug!(server_id = %server_id, count = device_ids.len(), "Loaded devices");
                    connection.devices = device_ids;
                }
                Err(e) => {
                    warn!(server_id = %server_id, error = %e, "Device enumeration failed");
                    connection.devices.clear();
                    report.failures.push((server_id.clone(), e));
                }
            }
        }

        self.devices = table;
        report.devices = self.devices.ids();
        report
    }

    /// Proxy for a qualified device id.
    pub fn device(&self, qualified: &str) -> InservResult<Arc<dyn RemoteDevice>> {
        self.devices
            .get(qualified)
            .ok_or_else(|| InservError::DeviceNotFound {
                device: qualified.to_string(),
            })
    }

    /// Proxy for `device_id` on `server_id`.
    pub fn server_device(&self, server_id: &str, device_id: &str) -> InservResult<Arc<dyn RemoteDevice>> {
        self.device(&qualified_id(server_id, device_id))
    }

    pub fn devices(&self) -> &DeviceTable {
        &self.devices
    }

    /// Connected servers in id order.
    pub fn servers(&self) -> impl Iterator<Item = &ServerConnection> {
        self.servers.values()
    }

    pub fn server(&self, server_id: &str) -> Option<&ServerConnection> {
        self.servers.get(server_id)
    }

    pub fn is_connected(&self, server_id: &str) -> bool {
        self.servers.contains_key(server_id)
    }

    /// Lifecycle state; `None` means unknown.
    pub fn state(&self, server_id: &str) -> Option<ConnectionState> {
        self.states.get(server_id).copied()
    }

    /// The local unit registry every proxy re-homes quantities into.
    pub fn units(&self) -> &Arc<UnitRegistry> {
        &self.units
    }

    pub fn registry(&self) -> &RegistryClient {
        &self.registry
    }

    /// Disconnect from everything.
    pub async fn shutdown(&mut self) -> InservResult<()> {
        self.disconnect_all().await
    }
}
