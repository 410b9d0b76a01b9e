//! Minimal in-memory plugin.
//!
//! Demonstrates the pieces a plugin author supplies:
//! 1. A handler implementing the read/write callbacks for its protocol
//! 2. Device definitions bound to the handler
//! 3. Plugin assembly and run
//!
//! Run with `cargo run --example memory_plugin -- --debug`; stop with ctrl-c.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use neoplug_sdk::{
    Capabilities, Device, DeviceHandler, Plugin, PluginMetadata, PluginSettings, Reading,
    SdkError, SdkResult, Unit, WriteData,
};

/// An "airflow controller" backed by nothing but an atomic counter.
struct MemoryAirflow {
    target: AtomicI64,
}

#[async_trait::async_trait]
impl DeviceHandler for MemoryAirflow {
    fn name(&self) -> &str {
        "memory-airflow"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::new().read().write()
    }

    async fn read(&self, device: &Device) -> SdkResult<Vec<Reading>> {
        let base = self.target.load(Ordering::Relaxed);
        let jitter = device.id().as_bytes()[0] as i64 % 7;
        Ok(vec![Reading::new("airflow", base + jitter)
            .with_unit(Unit::new("cubic feet per minute", "CFM"))])
    }

    async fn write(&self, _device: &Device, data: &WriteData) -> SdkResult<()> {
        match data.action.as_str() {
            "target" => {
                let value = data.data.as_i64().ok_or_else(|| {
                    SdkError::InvalidArgument("target requires an integer payload".into())
                })?;
                self.target.store(value, Ordering::Relaxed);
                Ok(())
            }
            other => Err(SdkError::Unsupported(format!("unknown action '{}'", other))),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let metadata = PluginMetadata::new("memory", "neoplug")
        .with_description("An example plugin backed by in-memory state");

    let plugin = Plugin::builder(metadata, PluginSettings::default())
        .register_handler(Arc::new(MemoryAirflow {
            target: AtomicI64::new(100),
        }))
        .register_device(
            Device::new("airflow", "memory-airflow")
                .with_info("intake fan airflow")
                .with_data("channel", serde_json::json!(1))
                .with_alias("intake"),
        )
        .register_device(
            Device::new("airflow", "memory-airflow")
                .with_info("exhaust fan airflow")
                .with_data("channel", serde_json::json!(2))
                .with_alias("exhaust"),
        )
        .build()
        .await?;

    plugin.run().await?;
    Ok(())
}
