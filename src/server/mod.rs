//! Instrument server: device set, RPC endpoint, lifecycle and operator shell.

pub mod core;
pub mod devices;
pub mod endpoint;
pub mod shell;

pub use self::core::{EndpointState, InstrumentServer};
pub use devices::{AccessError, DeviceLease, DeviceSet};
