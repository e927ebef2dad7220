//! Crate-wide error type.
//!
//! `InservError` is the error returned by every public operation of the
//! instrument manager, the device proxies and the instrument server. Each
//! variant carries the identifying key of the failing entity (server id,
//! qualified device id, attribute, unit) so callers can act on a failure
//! without parsing messages.
//!
//! ## Error Hierarchy
//!
//! - **`Discovery`**: the service registry could not be read, or one of the
//!   matching containers held a missing/malformed settings document. Discovery
//!   is atomic, so this always means "no entries at all".
//! - **`Connect`** / **`Connection`**: opening a channel failed, or an
//!   established channel broke (including timeouts, reported as `"timed out"`).
//! - **`ProxyConversion`**: a remote quantity names a unit the local unit
//!   registry does not know.
//! - **`Remote`**: the server processed the call and answered with an error.
//! - **`DeviceLoad`** / **`DeviceLoadFailures`**: driver construction failed on
//!   the server side, singly or during a bulk reload.
//!
//! Module-local errors (`ConfigError`, `RegistryError`, `UnitError`,
//! `ProtocolError`) convert into `InservError` with `?`.

use thiserror::Error;

use crate::config::ConfigError;
use crate::protocol::{ProtocolError, RemoteErrorKind};
use crate::registry::RegistryError;
use crate::units::UnitError;

/// Convenience alias for results using the crate error type.
pub type InservResult<T> = std::result::Result<T, InservError>;

#[derive(Error, Debug)]
pub enum InservError {
    #[error("Service registry discovery failed at {location}: {source}")]
    Discovery {
        location: String,
        #[source]
        source: RegistryError,
    },

    #[error("Service registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Failed to connect to server '{server_id}' at {address}: {reason}")]
    Connect {
        server_id: String,
        address: String,
        reason: String,
    },

    #[error("Connection to server '{server_id}' failed: {reason}")]
    Connection { server_id: String, reason: String },

    #[error("Server '{server_id}' is not connected")]
    NotConnected { server_id: String },

    #[error(
        "Cannot convert attribute '{attribute}' of device '{device}' on server '{server_id}': \
         unit '{unit}' is not defined in the local unit registry"
    )]
    ProxyConversion {
        server_id: String,
        device: String,
        attribute: String,
        unit: String,
    },

    #[error("Device '{device}' not found")]
    DeviceNotFound { device: String },

    #[error("Failed to load device '{device}': {reason}")]
    DeviceLoad { device: String, reason: String },

    #[error("{} device(s) failed to load: {}", .0.len(), join_errors(.0))]
    DeviceLoadFailures(Vec<InservError>),

    #[error("Server '{server_id}' rejected call on device '{device}' ({kind}): {message}")]
    Remote {
        server_id: String,
        device: String,
        kind: RemoteErrorKind,
        message: String,
    },

    #[error("Endpoint error: {0}")]
    Endpoint(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Unit error: {0}")]
    Unit(#[from] UnitError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn join_errors(errors: &[InservError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl InservError {
    /// Name of the device this error is about, when it concerns one device.
    pub fn device(&self) -> Option<&str> {
        match self {
            Self::DeviceNotFound { device }
            | Self::DeviceLoad { device, .. }
            | Self::Remote { device, .. }
            | Self::ProxyConversion { device, .. } => Some(device),
            _ => None,
        }
    }

    /// Whether this error means the transport to a server is unusable.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connect { .. } | Self::Connection { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_failures_are_summarized() {
        let err = InservError::DeviceLoadFailures(vec![
            InservError::DeviceLoad {
                device: "laser".into(),
                reason: "port busy".into(),
            },
            InservError::DeviceLoad {
                device: "stage".into(),
                reason: "unknown driver".into(),
            },
        ]);

        let text = err.to_string();
        assert!(text.starts_with("2 device(s) failed to load"));
        assert!(text.contains("laser"));
        assert!(text.contains("unknown driver"));
    }

    #[test]
    fn device_accessor() {
        let err = InservError::DeviceNotFound {
            device: "lab1/sg".into(),
        };
        assert_eq!(err.device(), Some("lab1/sg"));
        assert!(!err.is_connection_error());

        let err = InservError::Connection {
            server_id: "lab1".into(),
            reason: "timed out".into(),
        };
        assert_eq!(err.device(), None);
        assert!(err.is_connection_error());
    }
}
