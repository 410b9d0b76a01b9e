//! Devices and device handlers.
//!
//! A handler is a named capability bundle implemented as a trait object; the
//! capability set is declared explicitly at registration rather than inferred
//! from which methods happen to be overridden. A device references its
//! handler by name and is bound to the registered instance when it enters the
//! catalog.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{SdkError, SdkResult};
use crate::reading::{ReadContext, Reading, Transform, Value};
use crate::tag::Tag;

/// The operations a handler implements.
///
/// At least one capability must be set. `bulk_read` is only scheduled when
/// `read` is absent; when both are set, per-device reads win.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub read: bool,
    pub bulk_read: bool,
    pub write: bool,
    pub listen: bool,
}

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(mut self) -> Self {
        self.read = true;
        self
    }

    pub fn bulk_read(mut self) -> Self {
        self.bulk_read = true;
        self
    }

    pub fn write(mut self) -> Self {
        self.write = true;
        self
    }

    pub fn listen(mut self) -> Self {
        self.listen = true;
        self
    }

    /// Whether any capability is set.
    pub fn any(&self) -> bool {
        self.read || self.bulk_read || self.write || self.listen
    }

    /// Whether the handler participates in the read loop at all.
    pub fn readable(&self) -> bool {
        self.read || self.bulk_read
    }
}

/// Data for a single write operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteData {
    /// The action to perform, e.g. `color`, `state`.
    pub action: String,
    /// Action payload; interpretation belongs to the handler.
    #[serde(default)]
    pub data: serde_json::Value,
}

impl WriteData {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            data: serde_json::Value::Null,
        }
    }

    /// Set the payload.
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// Push channel handed to listener handlers.
#[derive(Debug, Clone)]
pub struct ReadingSink {
    tx: async_channel::Sender<ReadContext>,
}

impl ReadingSink {
    pub(crate) fn new(tx: async_channel::Sender<ReadContext>) -> Self {
        Self { tx }
    }

    /// Forward a batch of readings. Fails once the plugin is stopping.
    pub async fn push(&self, ctx: ReadContext) -> SdkResult<()> {
        self.tx
            .send(ctx)
            .await
            .map_err(|_| SdkError::Transient("reading channel closed".into()))
    }
}

/// A named bundle of read/write/listen/bulk-read callbacks.
///
/// Unimplemented operations keep their default bodies, which fail with
/// [`SdkError::Unsupported`]; the scheduler never calls an operation whose
/// capability is not declared.
#[async_trait]
pub trait DeviceHandler: Send + Sync {
    /// Registration name; device configs reference it.
    fn name(&self) -> &str;

    /// The declared capability set.
    fn capabilities(&self) -> Capabilities;

    /// Read one device.
    async fn read(&self, device: &Device) -> SdkResult<Vec<Reading>> {
        let _ = device;
        Err(SdkError::Unsupported(format!(
            "handler '{}' does not support reads",
            self.name()
        )))
    }

    /// Read all devices of this handler in one call.
    async fn bulk_read(&self, devices: &[Arc<Device>]) -> SdkResult<Vec<ReadContext>> {
        let _ = devices;
        Err(SdkError::Unsupported(format!(
            "handler '{}' does not support bulk reads",
            self.name()
        )))
    }

    /// Execute one write against a device.
    async fn write(&self, device: &Device, data: &WriteData) -> SdkResult<()> {
        let _ = (device, data);
        Err(SdkError::Unsupported(format!(
            "handler '{}' does not support writes",
            self.name()
        )))
    }

    /// Long-running push listener. Runs until error or shutdown; the worker
    /// restarts it with backoff on error.
    async fn listen(&self, device: &Device, sink: ReadingSink) -> SdkResult<()> {
        let _ = (device, sink);
        Err(SdkError::Unsupported(format!(
            "handler '{}' does not support listening",
            self.name()
        )))
    }
}

/// One manageable entity: a sensor channel, a relay, a fan.
///
/// Built fluently, then registered through the device manager, which assigns
/// the deterministic id and binds the handler. Catalog entries are immutable.
#[derive(Clone)]
pub struct Device {
    /// Device type, e.g. `temperature`.
    pub device_type: String,
    /// Human-readable description.
    pub info: String,
    /// Arbitrary string metadata.
    pub metadata: HashMap<String, String>,
    /// Tag set; always contains the auto-generated id and type tags once
    /// registered.
    pub tags: Vec<Tag>,
    /// Opaque protocol data handed to the handler.
    pub data: serde_json::Map<String, serde_json::Value>,
    /// Name of the handler that services this device.
    pub handler_name: String,
    /// Optional unique human-friendly alias.
    pub alias: Option<String>,
    /// Optional multiplier applied to numeric readings after the transform
    /// pipeline.
    pub scaling_factor: Option<f64>,
    /// Reading-transform pipeline, applied in order.
    pub transforms: Vec<Transform>,
    /// Budget for a single write; exceeding it fails the transaction.
    pub write_timeout: Duration,
    /// Sort weight within the catalog; lower sorts first.
    pub sort_index: i32,

    pub(crate) id: Option<Uuid>,
    pub(crate) id_name: Option<String>,
    pub(crate) handler: Option<Arc<dyn DeviceHandler>>,
}

impl Device {
    pub fn new(device_type: impl Into<String>, handler_name: impl Into<String>) -> Self {
        Self {
            device_type: device_type.into(),
            info: String::new(),
            metadata: HashMap::new(),
            tags: Vec::new(),
            data: serde_json::Map::new(),
            handler_name: handler_name.into(),
            alias: None,
            scaling_factor: None,
            transforms: Vec::new(),
            write_timeout: Duration::from_secs(30),
            sort_index: 0,
            id: None,
            id_name: None,
            handler: None,
        }
    }

    /// Set the description.
    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.info = info.into();
        self
    }

    /// Add a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Add a tag.
    pub fn with_tag(mut self, tag: Tag) -> Self {
        self.tags.push(tag);
        self
    }

    /// Add a data entry.
    pub fn with_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Replace the whole data map.
    pub fn with_data_map(mut self, data: serde_json::Map<String, serde_json::Value>) -> Self {
        self.data = data;
        self
    }

    /// Set the alias.
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Set the scaling factor.
    pub fn with_scaling_factor(mut self, factor: f64) -> Self {
        self.scaling_factor = Some(factor);
        self
    }

    /// Append a transform stage.
    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transforms.push(transform);
        self
    }

    /// Set the write timeout.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the sort index.
    pub fn with_sort_index(mut self, sort_index: i32) -> Self {
        self.sort_index = sort_index;
        self
    }

    /// The canonical device id. Nil until the device is registered.
    pub fn id(&self) -> Uuid {
        self.id.unwrap_or_else(Uuid::nil)
    }

    /// The name the id was derived from. Empty until registered.
    pub fn id_name(&self) -> &str {
        self.id_name.as_deref().unwrap_or("")
    }

    /// The bound handler.
    pub fn handler(&self) -> SdkResult<Arc<dyn DeviceHandler>> {
        self.handler.clone().ok_or_else(|| {
            SdkError::Fatal(format!(
                "device '{}' ({}) has no bound handler",
                self.id(),
                self.info
            ))
        })
    }

    /// Capability set of the bound handler; empty when unbound.
    pub fn capabilities(&self) -> Capabilities {
        self.handler
            .as_ref()
            .map(|h| h.capabilities())
            .unwrap_or_default()
    }

    /// Whether the read loop schedules this device.
    pub fn is_readable(&self) -> bool {
        self.capabilities().readable()
    }

    /// Whether writes are accepted for this device.
    pub fn is_writable(&self) -> bool {
        self.capabilities().write
    }

    /// Whether a listener worker is spawned for this device.
    pub fn is_listener(&self) -> bool {
        self.capabilities().listen
    }

    /// Run a reading through the transform pipeline, then the scaling
    /// factor, then precision rounding.
    pub fn apply_transforms(&self, mut reading: Reading) -> SdkResult<Reading> {
        for transform in &self.transforms {
            reading.value = transform.apply(&reading.value)?;
        }
        if let Some(factor) = self.scaling_factor {
            let v = reading.value.as_f64().ok_or_else(|| {
                SdkError::InvalidArgument(format!(
                    "cannot scale non-numeric reading '{}' from device {}",
                    reading.output,
                    self.id()
                ))
            })?;
            reading.value = Value::Float(v * factor);
        }
        if let Some(precision) = reading.precision {
            if let Value::Float(v) = reading.value {
                let scale = 10f64.powi(precision as i32);
                reading.value = Value::Float((v * scale).round() / scale);
            }
        }
        Ok(reading)
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("type", &self.device_type)
            .field("info", &self.info)
            .field("handler", &self.handler_name)
            .field("alias", &self.alias)
            .field("tags", &self.tags)
            .field("sort_index", &self.sort_index)
            .finish_non_exhaustive()
    }
}
