//! SDK for building device plugins for the NeoPlug control plane.
//!
//! A plugin exposes heterogeneous physical or virtual devices to the control
//! plane through a uniform remote-procedure surface. The plugin author
//! supplies per-protocol handlers and declarative device configuration; the
//! SDK owns everything else:
//!
//! - **DeviceManager**: the device catalog with deterministic identity,
//!   handler binding, and tag/alias indexes
//! - **DataManager**: serial or parallel read loops, bulk-read batching,
//!   push listeners, and the transactional write pipeline
//! - **TransactionStore**: bounded, TTL-expiring receipts for asynchronous
//!   writes
//! - **HealthRegistry**: periodic checks with built-in queue-utilisation
//!   monitoring
//! - **Plugin**: ordered lifecycle bring-up and tear-down
//! - **PluginServer**: the transport-agnostic RPC surface
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use neoplug_sdk::{
//!     Capabilities, Device, DeviceHandler, Plugin, PluginMetadata, PluginSettings, Reading,
//!     SdkResult,
//! };
//!
//! struct Thermistor;
//!
//! #[async_trait::async_trait]
//! impl DeviceHandler for Thermistor {
//!     fn name(&self) -> &str {
//!         "thermistor"
//!     }
//!
//!     fn capabilities(&self) -> Capabilities {
//!         Capabilities::new().read()
//!     }
//!
//!     async fn read(&self, _device: &Device) -> SdkResult<Vec<Reading>> {
//!         Ok(vec![Reading::new("temperature", 20.5)])
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let metadata = PluginMetadata::new("example", "neoplug");
//!     let plugin = Plugin::builder(metadata, PluginSettings::default())
//!         .register_handler(Arc::new(Thermistor))
//!         .register_device(
//!             Device::new("temperature", "thermistor")
//!                 .with_data("channel", serde_json::json!(1)),
//!         )
//!         .build()
//!         .await?;
//!     plugin.run().await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod cli;
pub mod config;
pub mod device;
pub mod error;
pub mod health;
pub mod identity;
pub mod manager;
pub mod plugin;
pub mod reading;
pub mod scheduler;
pub mod server;
pub mod tag;
pub mod transaction;

// Re-exports for convenience
pub use cache::ReadingCache;
pub use config::{
    ConfigPolicy, DeviceConfig, IdentitySettings, ListenSettings, MetricsSettings,
    PluginMetadata, PluginSettings, PolicySettings, ReadMode, ReadSettings,
    TransactionSettings, WriteSettings,
};
pub use device::{Capabilities, Device, DeviceHandler, ReadingSink, WriteData};
pub use error::{MultiError, SdkError, SdkResult};
pub use health::{
    CheckOutcome, CheckSnapshot, HealthCheck, HealthRegistry, HealthSnapshot, HealthStatus,
};
pub use identity::{default_device_identifier, PluginId};
pub use manager::{
    DeviceFilter, DeviceManager, DeviceSelector, DeviceSetupAction, FilterField,
};
pub use plugin::{Plugin, PluginAction, PluginBuilder};
pub use reading::{ReadContext, Reading, Transform, Unit, Value};
pub use scheduler::{DataManager, DataManagerState};
pub use server::{DeviceSnapshot, Metadata, PluginServer, ReadingStream, VersionInfo};
pub use tag::Tag;
pub use transaction::{Status, Transaction, TransactionStore};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build information
pub const BUILD_PROFILE: &str = if cfg!(debug_assertions) {
    "debug"
} else {
    "release"
};
