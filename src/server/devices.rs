//! Local device set of an instrument server.
//!
//! Each attached device lives in its own slot guarded by an async mutex. The
//! mutex is held for the whole duration of an attribute access, a load or a
//! delete, so calls reaching the same device are strictly serialized while
//! calls to different devices proceed in parallel. Waiting for a busy device
//! blocks; it never fails fast.
//!
//! A device that is not in the set is "not attached": every call naming it
//! fails with [`AccessError::NotAttached`] and nothing is created implicitly.
//! A device whose driver is still being built is not attached yet; it becomes
//! visible once construction succeeds.
//!
//! [`DeviceSet::acquire`] hands out a [`DeviceLease`] that owns the device
//! lock, so callers can give up while waiting for a busy device without ever
//! interrupting a call already running on it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::config::DeviceConfig;
use crate::drivers::{Device, DeviceError, DriverCatalog};
use crate::error::{InservError, InservResult};
use crate::protocol::{AttributeInfo, RemoteError, RemoteErrorKind};
use crate::units::UnitRegistry;
use crate::value::AttrValue;

/// Failure of a call routed to one device.
#[derive(Debug, Error)]
pub enum AccessError {
    #[error("Device '{0}' is not attached")]
    NotAttached(String),

    #[error("Device '{device}': {source}")]
    Driver {
        device: String,
        #[source]
        source: DeviceError,
    },
}

impl AccessError {
    /// Error payload sent back to the RPC client.
    pub fn to_remote(&self) -> RemoteError {
        let kind = match self {
            AccessError::NotAttached(_) => RemoteErrorKind::DeviceNotFound,
            AccessError::Driver { source, .. } => source.remote_kind(),
        };
        RemoteError::new(kind, self.to_string())
    }
}

struct DeviceSlot {
    driver: Arc<Mutex<Option<Box<dyn Device>>>>,
    /// Set while the slot holds a built driver; only changed under the lock.
    attached: AtomicBool,
}

impl DeviceSlot {
    fn empty() -> Arc<Self> {
        Arc::new(Self {
            driver: Arc::new(Mutex::new(None)),
            attached: AtomicBool::new(false),
        })
    }

    fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    fn set_attached(&self, attached: bool) {
        self.attached.store(attached, Ordering::Release);
    }
}

/// Exclusive access to one attached device, released on drop.
pub struct DeviceLease {
    name: String,
    guard: OwnedMutexGuard<Option<Box<dyn Device>>>,
}

impl std::fmt::Debug for DeviceLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceLease").field("name", &self.name).finish()
    }
}

impl DeviceLease {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn driver(&mut self) -> Result<&mut Box<dyn Device>, AccessError> {
        self.guard
            .as_mut()
            .ok_or_else(|| AccessError::NotAttached(self.name.clone()))
    }

    fn driver_error(&self, source: DeviceError) -> AccessError {
        AccessError::Driver {
            device: self.name.clone(),
            source,
        }
    }

    pub fn attributes(&mut self) -> Result<Vec<AttributeInfo>, AccessError> {
        Ok(self.driver()?.attributes())
    }

    pub async fn get(&mut self, attribute: &str) -> Result<AttrValue, AccessError> {
        let result = self.driver()?.get(attribute).await;
        result.map_err(|source| self.driver_error(source))
    }

    pub async fn set(&mut self, attribute: &str, value: AttrValue) -> Result<(), AccessError> {
        let result = self.driver()?.set(attribute, value).await;
        result.map_err(|source| self.driver_error(source))
    }
}

/// Devices attached to one server.
#[derive(Default)]
pub struct DeviceSet {
    slots: RwLock<BTreeMap<String, Arc<DeviceSlot>>>,
}

impl std::fmt::Debug for DeviceSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.names()).finish()
    }
}

impl DeviceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attached device names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.slots
            .read()
            .iter()
            .filter(|(_, slot)| slot.is_attached())
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.slots
            .read()
            .get(name)
            .is_some_and(|slot| slot.is_attached())
    }

    pub fn len(&self) -> usize {
        self.slots.read().values().filter(|slot| slot.is_attached()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, name: &str) -> Result<Arc<DeviceSlot>, AccessError> {
        self.slots
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| AccessError::NotAttached(name.to_string()))
    }

    fn is_current(&self, name: &str, slot: &Arc<DeviceSlot>) -> bool {
        self.slots
            .read()
            .get(name)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
    }

    /// (Re)instantiate the device described by `config`.
    ///
    /// Any previous driver under the same name is closed first, under the
    /// device lock. On failure the device is left absent.
    pub async fn load(
        &self,
        config: &DeviceConfig,
        catalog: &DriverCatalog,
        units: Arc<UnitRegistry>,
    ) -> InservResult<()> {
        let name = config.name.as_str();
        let load_error = |reason: String| InservError::DeviceLoad {
            device: name.to_string(),
            reason,
        };

        // A concurrent delete may detach the slot between lookup and lock;
        // retry until the locked slot is the one registered under `name`.
        let (slot, mut guard) = loop {
            let slot = self
                .slots
                .write()
                .entry(name.to_string())
                .or_insert_with(DeviceSlot::empty)
                .clone();
            let guard = slot.driver.clone().lock_owned().await;
            if self.is_current(name, &slot) {
                break (slot, guard);
            }
        };

        slot.set_attached(false);
        if let Some(mut previous) = guard.take() {
            debug!(device = name, "Closing previous driver");
            if let Err(e) = previous.close().await {
                warn!(device = name, error = %e, "Error closing previous driver");
            }
        }

        let built = match catalog.build(config, units) {
            Ok(mut driver) => match driver.initialize().await {
                Ok(()) => Ok(driver),
                Err(e) => {
                    if let Err(close_err) = driver.close().await {
                        debug!(device = name, error = %close_err, "Error closing failed driver");
                    }
                    Err(e)
                }
            },
            Err(e) => Err(e),
        };

        match built {
            Ok(driver) => {
                *guard = Some(driver);
                slot.set_attached(true);
                info!(device = name, driver = %config.driver, "Device loaded");
                Ok(())
            }
            Err(e) => {
                let mut slots = self.slots.write();
                if slots.get(name).is_some_and(|current| Arc::ptr_eq(current, &slot)) {
                    slots.remove(name);
                }
                warn!(device = name, error = %e, "Device failed to load");
                Err(load_error(e.to_string()))
            }
        }
    }

    /// Close and detach `name`. Returns `false` if it was not attached.
    pub async fn delete(&self, name: &str) -> bool {
        let Some(slot) = self.slots.write().remove(name) else {
            return false;
        };

        let mut guard = slot.driver.lock().await;
        slot.set_attached(false);
        match guard.take() {
            Some(mut driver) => {
                if let Err(e) = driver.close().await {
                    warn!(device = name, error = %e, "Error closing driver");
                }
                info!(device = name, "Device deleted");
                true
            }
            // A load failed on this slot while we were waiting.
            None => false,
        }
    }

    /// Delete every device, including any still being loaded; returns the
    /// names that held a driver.
    pub async fn delete_all(&self) -> Vec<String> {
        let pending: Vec<String> = self.slots.read().keys().cloned().collect();
        let mut deleted = Vec::new();
        for name in pending {
            if self.delete(&name).await {
                deleted.push(name);
            }
        }
        deleted
    }

    /// Wait for exclusive access to `name`.
    pub async fn acquire(&self, name: &str) -> Result<DeviceLease, AccessError> {
        let slot = self.slot(name)?;
        let guard = slot.driver.clone().lock_owned().await;
        if guard.is_none() {
            return Err(AccessError::NotAttached(name.to_string()));
        }
        Ok(DeviceLease {
            name: name.to_string(),
            guard,
        })
    }

    pub async fn attributes(&self, name: &str) -> Result<Vec<AttributeInfo>, AccessError> {
        self.acquire(name).await?.attributes()
    }

    pub async fn get(&self, name: &str, attribute: &str) -> Result<AttrValue, AccessError> {
        self.acquire(name).await?.get(attribute).await
    }

    pub async fn set(&self, name: &str, attribute: &str, value: AttrValue) -> Result<(), AccessError> {
        self.acquire(name).await?.set(attribute, value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::mock;

    fn units() -> Arc<UnitRegistry> {
        Arc::new(UnitRegistry::new())
    }

    #[tokio::test]
    async fn load_get_delete() {
        let set = DeviceSet::new();
        let catalog = DriverCatalog::with_builtin();
        let units = units();

        set.load(&DeviceConfig::new("sg", mock::SIGNAL_GENERATOR), &catalog, units.clone())
            .await
            .unwrap();
        assert_eq!(set.names(), ["sg"]);

        let value = set.get("sg", "amplitude").await.unwrap();
        assert!(value.as_quantity().unwrap().belongs_to(&units));

        assert!(set.delete("sg").await);
        assert!(!set.delete("sg").await);
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn absent_devices_are_not_created() {
        let set = DeviceSet::new();
        let err = set.get("ghost", "power").await.unwrap_err();
        assert!(matches!(err, AccessError::NotAttached(ref name) if name == "ghost"));
        assert_eq!(err.to_remote().kind, RemoteErrorKind::DeviceNotFound);
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn failed_load_leaves_device_absent() {
        let set = DeviceSet::new();
        let catalog = DriverCatalog::with_builtin();

        set.load(&DeviceConfig::new("pm", mock::POWER_METER), &catalog, units())
            .await
            .unwrap();
        let broken = DeviceConfig::new("pm", mock::POWER_METER).with_setting("fail_on_load", true);
        let err = set.load(&broken, &catalog, units()).await.unwrap_err();

        assert!(matches!(err, InservError::DeviceLoad { ref device, .. } if device == "pm"));
        assert!(!set.contains("pm"));
    }

    #[tokio::test]
    async fn driver_errors_are_classified() {
        let set = DeviceSet::new();
        let catalog = DriverCatalog::with_builtin();
        set.load(&DeviceConfig::new("pm", mock::POWER_METER), &catalog, units())
            .await
            .unwrap();

        let err = set.set("pm", "power", AttrValue::Float(1.0)).await.unwrap_err();
        assert_eq!(err.to_remote().kind, RemoteErrorKind::ReadOnly);

        let attributes = set.attributes("pm").await.unwrap();
        assert_eq!(attributes.len(), 2);
    }
}
