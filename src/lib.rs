//! Networked laboratory instrument servers and a client-side instrument manager.
//!
//! Instrument servers host device drivers and expose them over a small RPC
//! protocol; they advertise themselves in a shared service registry. The
//! [`manager::InstrumentManager`] discovers every advertised server, connects
//! to it and presents all remote devices under `"<server>/<device>"` ids.
//! Physical quantities read through a [`proxy::DeviceProxy`] are rebuilt in
//! the caller's own [`units::UnitRegistry`].
//!
//! # Example
//!
//! ```no_run
//! use rust_inserv::config::ClientConfig;
//! use rust_inserv::manager::InstrumentManager;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ClientConfig::load_from("config/client.toml")?;
//!     let mut manager = InstrumentManager::from_config(&config).await?;
//!
//!     let sg = manager.device("lab1/sg")?;
//!     let amplitude = sg.get("amplitude").await?;
//!     println!("amplitude = {amplitude}");
//!
//!     manager.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod device_table;
pub mod drivers;
pub mod error;
pub mod logging;
pub mod manager;
pub mod protocol;
pub mod proxy;
pub mod registry;
pub mod rpc;
pub mod server;
pub mod units;
pub mod value;

pub use error::{InservError, InservResult};
