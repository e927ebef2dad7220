//! Flat namespace of remote devices keyed by `"<server_id>/<device_id>"`.

use std::collections::HashMap;
use std::sync::Arc;

use crate::proxy::RemoteDevice;

/// Separator between server id and device id.
pub const SEPARATOR: char = '/';

/// Build a qualified device id.
pub fn qualified_id(server_id: &str, device_id: &str) -> String {
    format!("{server_id}{SEPARATOR}{device_id}")
}

/// Split a qualified device id into `(server_id, device_id)`.
pub fn split_qualified_id(id: &str) -> Option<(&str, &str)> {
    id.split_once(SEPARATOR)
        .filter(|(server, device)| !server.is_empty() && !device.is_empty())
}

/// Map of qualified id → device proxy.
#[derive(Clone, Default)]
pub struct DeviceTable {
    devices: HashMap<String, Arc<dyn RemoteDevice>>,
}

impl std::fmt::Debug for DeviceTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.ids()).finish()
    }
}

impl DeviceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert under the device's qualified id, returning a replaced entry.
    pub fn insert(&mut self, device: Arc<dyn RemoteDevice>) -> Option<Arc<dyn RemoteDevice>> {
        self.devices.insert(device.qualified_id().to_string(), device)
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn RemoteDevice>> {
        self.devices.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.devices.contains_key(id)
    }

    /// Remove every device of `server_id`; returns how many were removed.
    pub fn remove_server(&mut self, server_id: &str) -> usize {
        let prefix = format!("{server_id}{SEPARATOR}");
        let before = self.devices.len();
        self.devices.retain(|id, _| !id.starts_with(&prefix));
        before - self.devices.len()
    }

    /// All qualified ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.devices.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn RemoteDevice>)> {
        self.devices.iter().map(|(id, device)| (id.as_str(), device))
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
