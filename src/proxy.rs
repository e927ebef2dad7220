//! Device proxies.
//!
//! A [`DeviceProxy`] is the local stand-in for one device hosted by a remote
//! instrument server. It forwards attribute access over the server's
//! [`RpcChannel`] and re-homes every quantity it reads into the local
//! [`UnitRegistry`], so values returned by a proxy can be combined freely with
//! quantities built locally.
//!
//! Writes are sent as-is: quantities go out as `(magnitude, unit string)` and
//! the server interprets them in its own registry.

use std::sync::Arc;

use async_trait::async_trait;

use crate::device_table::qualified_id;
use crate::error::{InservError, InservResult};
use crate::protocol::AttributeInfo;
use crate::rpc::RpcChannel;
use crate::units::{UnitError, UnitRegistry};
use crate::value::AttrValue;

/// Attribute access to a device reachable through the instrument manager.
#[async_trait]
pub trait RemoteDevice: Send + Sync {
    /// `"<server_id>/<device_id>"`.
    fn qualified_id(&self) -> &str;

    /// Read an attribute; quantities are bound to the local unit registry.
    async fn get(&self, attribute: &str) -> InservResult<AttrValue>;

    /// Write an attribute.
    async fn set(&self, attribute: &str, value: AttrValue) -> InservResult<()>;

    /// Attributes exposed by the device.
    async fn attributes(&self) -> InservResult<Vec<AttributeInfo>>;
}

/// Forwarding proxy for one remote device.
pub struct DeviceProxy {
    server_id: String,
    device_id: String,
    qualified_id: String,
    channel: Arc<dyn RpcChannel>,
    units: Arc<UnitRegistry>,
}

impl std::fmt::Debug for DeviceProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceProxy")
            .field("qualified_id", &self.qualified_id)
            .finish_non_exhaustive()
    }
}

impl DeviceProxy {
    pub fn new(
        server_id: &str,
        device_id: &str,
        channel: Arc<dyn RpcChannel>,
        units: Arc<UnitRegistry>,
    ) -> Self {
        Self {
            server_id: server_id.to_string(),
            device_id: device_id.to_string(),
            qualified_id: qualified_id(server_id, device_id),
            channel,
            units,
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}

#[async_trait]
impl RemoteDevice for DeviceProxy {
    fn qualified_id(&self) -> &str {
        &self.qualified_id
    }

    async fn get(&self, attribute: &str) -> InservResult<AttrValue> {
        let value = self.channel.get_attribute(&self.device_id, attribute).await?;
        AttrValue::from_wire(value, &self.units).map_err(|e| match e {
            UnitError::UndefinedUnit(unit) => InservError::ProxyConversion {
                server_id: self.server_id.clone(),
                device: self.device_id.clone(),
                attribute: attribute.to_string(),
                unit,
            },
            other => other.into(),
        })
    }

    async fn set(&self, attribute: &str, value: AttrValue) -> InservResult<()> {
        self.channel
            .set_attribute(&self.device_id, attribute, value.to_wire())
            .await
    }

    async fn attributes(&self) -> InservResult<Vec<AttributeInfo>> {
        self.channel.list_attributes(&self.device_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Value;
    use parking_lot::Mutex;

    /// Channel that answers every read with a fixed value and records writes.
    struct FixedChannel {
        reply: Value,
        writes: Mutex<Vec<(String, String, Value)>>,
    }

    impl FixedChannel {
        fn new(reply: Value) -> Arc<Self> {
            Arc::new(Self {
                reply,
                writes: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl RpcChannel for FixedChannel {
        fn server_id(&self) -> &str {
            "lab1"
        }
        async fn ping(&self) -> InservResult<String> {
            Ok("lab1".into())
        }
        async fn list_devices(&self) -> InservResult<Vec<String>> {
            Ok(vec!["sg".into()])
        }
        async fn list_attributes(&self, _device: &str) -> InservResult<Vec<AttributeInfo>> {
            Ok(vec![AttributeInfo::read_write("amplitude", Some("volt"))])
        }
        async fn get_attribute(&self, _device: &str, _attribute: &str) -> InservResult<Value> {
            Ok(self.reply.clone())
        }
        async fn set_attribute(&self, device: &str, attribute: &str, value: Value) -> InservResult<()> {
            self.writes
                .lock()
                .push((device.to_string(), attribute.to_string(), value));
            Ok(())
        }
        async fn close(&self) -> InservResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn reads_are_bound_to_local_registry() {
        let units = Arc::new(UnitRegistry::new());
        let channel = FixedChannel::new(Value::Quantity {
            magnitude: 1.0,
            unit: "volt".into(),
        });
        let proxy = DeviceProxy::new("lab1", "sg", channel, units.clone());
        assert_eq!(proxy.qualified_id(), "lab1/sg");

        let remote = proxy.get("amplitude").await.unwrap();
        let local = units.quantity(5.0, "volt").unwrap();
        let sum = remote.as_quantity().unwrap().checked_add(&local).unwrap();
        assert_eq!(sum.magnitude(), 6.0);
        assert_eq!(sum.unit().name(), "volt");
    }

    #[tokio::test]
    async fn unknown_unit_names_the_attribute() {
        let units = Arc::new(UnitRegistry::new());
        let channel = FixedChannel::new(Value::Quantity {
            magnitude: 2.0,
            unit: "furlong".into(),
        });
        let proxy = DeviceProxy::new("lab1", "odometer", channel, units);

        match proxy.get("distance").await.unwrap_err() {
            InservError::ProxyConversion {
                server_id,
                device,
                attribute,
                unit,
            } => {
                assert_eq!(server_id, "lab1");
                assert_eq!(device, "odometer");
                assert_eq!(attribute, "distance");
                assert_eq!(unit, "furlong");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn oversized_unit_exponent_is_a_conversion_error() {
        let units = Arc::new(UnitRegistry::new());
        let channel = FixedChannel::new(Value::Quantity {
            magnitude: 1.0,
            unit: "joule ** 100".into(),
        });
        let proxy = DeviceProxy::new("lab1", "calorimeter", channel, units);

        let err = proxy.get("energy").await.unwrap_err();
        assert!(matches!(
            err,
            InservError::ProxyConversion { ref attribute, ref unit, .. }
                if attribute == "energy" && unit == "joule ** 100"
        ));
    }

    #[tokio::test]
    async fn writes_pass_through() {
        let units = Arc::new(UnitRegistry::new());
        let channel = FixedChannel::new(Value::Null);
        let proxy = DeviceProxy::new("lab1", "sg", channel.clone(), units.clone());

        let amplitude = units.quantity(250.0, "mV").unwrap();
        proxy.set("amplitude", amplitude.into()).await.unwrap();
        proxy.set("output", AttrValue::Bool(true)).await.unwrap();

        let writes = channel.writes.lock();
        assert_eq!(
            writes[0],
            (
                "sg".to_string(),
                "amplitude".to_string(),
                Value::Quantity {
                    magnitude: 250.0,
                    unit: "millivolt".into()
                }
            )
        );
        assert_eq!(writes[1].2, Value::Bool(true));
    }

    #[tokio::test]
    async fn plain_values_are_untouched() {
        let units = Arc::new(UnitRegistry::new());
        let channel = FixedChannel::new(Value::Text("ACME SG-1".into()));
        let proxy = DeviceProxy::new("lab1", "sg", channel, units);
        assert_eq!(
            proxy.get("idn").await.unwrap(),
            AttrValue::Text("ACME SG-1".into())
        );
    }
}
