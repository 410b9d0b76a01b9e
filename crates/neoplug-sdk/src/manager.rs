//! The device manager: catalog, identity assignment, handler binding, and
//! tag/alias indexing.
//!
//! The catalog and its indexes are only mutated during plugin init; once the
//! data manager starts they are read-only, so lookups are cheap clones of
//! `Arc<Device>` entries.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ConfigPolicy, DeviceConfig, DynamicRegistrationSettings};
use crate::device::{Device, DeviceHandler};
use crate::error::{MultiError, SdkError, SdkResult};
use crate::identity::{default_device_identifier, device_id_name, PluginId};
use crate::tag::Tag;

/// Hook deriving the identity component of a device from its data map.
pub type DeviceIdentifier =
    Arc<dyn Fn(&serde_json::Map<String, serde_json::Value>) -> String + Send + Sync>;

/// Hook validating a device's data map before it enters the catalog.
pub type DeviceValidator = Arc<dyn Fn(&Device) -> SdkResult<()> + Send + Sync>;

/// Dynamic registration hook yielding device configs.
pub type DynamicConfigRegistrar =
    Arc<dyn Fn(&serde_json::Map<String, serde_json::Value>) -> SdkResult<Vec<DeviceConfig>> + Send + Sync>;

/// Dynamic registration hook yielding fully-materialized devices.
pub type DynamicDeviceRegistrar =
    Arc<dyn Fn(&serde_json::Map<String, serde_json::Value>) -> SdkResult<Vec<Device>> + Send + Sync>;

/// User hooks consulted while building the catalog.
#[derive(Clone, Default)]
pub struct DeviceHooks {
    /// Identity component derivation; defaults to the sorted-scalar
    /// concatenation of the device data map.
    pub identifier: Option<DeviceIdentifier>,
    /// Device-data validation, run before insertion.
    pub validator: Option<DeviceValidator>,
    /// Dynamic registration producing configs.
    pub dynamic_config: Option<DynamicConfigRegistrar>,
    /// Dynamic registration producing devices.
    pub dynamic_devices: Option<DynamicDeviceRegistrar>,
}

/// RPC input selecting devices by id/alias or by tag set.
///
/// When both an id and tags are given, the id wins and the tags are ignored
/// with a warning. An empty selector selects every device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceSelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<Tag>,
}

impl DeviceSelector {
    /// Select every device.
    pub fn all() -> Self {
        Self::default()
    }

    /// Select by canonical id or alias.
    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            tags: Vec::new(),
        }
    }

    /// Select by conjunctive tag set.
    pub fn by_tags(tags: impl IntoIterator<Item = Tag>) -> Self {
        Self {
            id: None,
            tags: tags.into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.id.is_none() && self.tags.is_empty()
    }
}

/// Fields a device filter may match on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterField {
    Type,
}

/// Additive device filter used by setup-action dispatch.
///
/// A device matches when any (field, value) pair matches; the wildcard value
/// `*` matches every device for that field.
#[derive(Debug, Clone, Default)]
pub struct DeviceFilter {
    fields: HashMap<FilterField, Vec<String>>,
}

impl DeviceFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter on device types.
    pub fn types<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new().with_field(FilterField::Type, values)
    }

    /// Add values for a field.
    pub fn with_field<I, S>(mut self, field: FilterField, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields
            .entry(field)
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.values().all(|values| values.is_empty())
    }

    /// Whether the device matches any (field, value) pair.
    pub fn matches(&self, device: &Device) -> bool {
        for (field, values) in &self.fields {
            let candidate = match field {
                FilterField::Type => device.device_type.as_str(),
            };
            if values.iter().any(|v| v == "*" || v == candidate) {
                return true;
            }
        }
        false
    }
}

/// A per-device action run once during plugin startup.
#[async_trait::async_trait]
pub trait DeviceSetupAction: Send + Sync {
    fn name(&self) -> &str;

    /// Which devices the action applies to; must be non-empty.
    fn filter(&self) -> DeviceFilter;

    async fn run(&self, device: &Device) -> SdkResult<()>;
}

struct Catalog {
    devices: HashMap<Uuid, Arc<Device>>,
    tag_index: HashMap<Tag, HashSet<Uuid>>,
    alias_index: HashMap<String, Uuid>,
    handler_index: HashMap<String, HashSet<Uuid>>,
    /// Catalog order: (sort_index, id_name), assigned at insertion.
    ordered: Vec<Uuid>,
}

impl Catalog {
    fn new() -> Self {
        Self {
            devices: HashMap::new(),
            tag_index: HashMap::new(),
            alias_index: HashMap::new(),
            handler_index: HashMap::new(),
            ordered: Vec::new(),
        }
    }
}

/// The device catalog and handler registry.
pub struct DeviceManager {
    plugin_id: PluginId,
    default_write_timeout: Duration,
    hooks: DeviceHooks,
    handlers: RwLock<HashMap<String, Arc<dyn DeviceHandler>>>,
    catalog: RwLock<Catalog>,
    setup_actions: RwLock<Vec<Arc<dyn DeviceSetupAction>>>,
}

impl DeviceManager {
    pub fn new(plugin_id: PluginId, default_write_timeout: Duration, hooks: DeviceHooks) -> Self {
        Self {
            plugin_id,
            default_write_timeout,
            hooks,
            handlers: RwLock::new(HashMap::new()),
            catalog: RwLock::new(Catalog::new()),
            setup_actions: RwLock::new(Vec::new()),
        }
    }

    /// The plugin identity devices are namespaced under.
    pub fn plugin_id(&self) -> &PluginId {
        &self.plugin_id
    }

    /// Register a handler. At least one capability must be declared and the
    /// name must be unused.
    pub async fn add_handler(&self, handler: Arc<dyn DeviceHandler>) -> SdkResult<()> {
        if !handler.capabilities().any() {
            return Err(SdkError::InvalidArgument(format!(
                "handler '{}' declares no capabilities",
                handler.name()
            )));
        }
        let mut handlers = self.handlers.write().await;
        if handlers.contains_key(handler.name()) {
            return Err(SdkError::Conflict(format!(
                "handler '{}' is already registered",
                handler.name()
            )));
        }
        debug!(handler = handler.name(), "registered device handler");
        handlers.insert(handler.name().to_string(), handler);
        Ok(())
    }

    /// Look up a handler by name.
    pub async fn handler(&self, name: &str) -> Option<Arc<dyn DeviceHandler>> {
        self.handlers.read().await.get(name).cloned()
    }

    /// Add a device to the catalog: bind its handler, validate its data,
    /// assign its deterministic id, auto-tag it, and index it.
    pub async fn add_device(&self, mut device: Device) -> SdkResult<Uuid> {
        let handler = self.handler(&device.handler_name).await.ok_or_else(|| {
            SdkError::NotFound(format!(
                "handler '{}' referenced by device '{}'",
                device.handler_name, device.info
            ))
        })?;

        if let Some(validator) = &self.hooks.validator {
            validator(&device).map_err(|e| {
                SdkError::InvalidArgument(format!(
                    "device '{}' failed validation: {}",
                    device.info, e
                ))
            })?;
        }

        if device.tags.iter().any(Tag::is_system) {
            return Err(SdkError::InvalidArgument(format!(
                "device '{}' carries authored tags in the reserved system namespace",
                device.info
            )));
        }

        if device.id.is_none() {
            let component = match &self.hooks.identifier {
                Some(identifier) => identifier(&device.data),
                None => default_device_identifier(&device.data),
            };
            let name = device_id_name(&device.device_type, &device.handler_name, &component);
            device.id = Some(self.plugin_id.namespaced_id(&name));
            device.id_name = Some(name);
        }
        let id = device.id();

        let mut catalog = self.catalog.write().await;
        if catalog.devices.contains_key(&id) {
            return Err(SdkError::Conflict(format!(
                "device id {} already exists (device '{}')",
                id, device.info
            )));
        }
        if let Some(alias) = &device.alias {
            if catalog.alias_index.contains_key(alias) {
                return Err(SdkError::Conflict(format!(
                    "alias '{}' already belongs to another device",
                    alias
                )));
            }
        }

        device.handler = Some(handler);
        device.tags.push(Tag::device_id(&id));
        device.tags.push(Tag::device_type(&device.device_type));
        device.tags.dedup();

        let device = Arc::new(device);
        for tag in &device.tags {
            catalog.tag_index.entry(tag.clone()).or_default().insert(id);
        }
        if let Some(alias) = &device.alias {
            catalog.alias_index.insert(alias.clone(), id);
        }
        catalog
            .handler_index
            .entry(device.handler_name.clone())
            .or_default()
            .insert(id);

        let sort_key = |d: &Arc<Device>| (d.sort_index, d.id_name().to_string());
        let key = sort_key(&device);
        let position = catalog
            .ordered
            .iter()
            .position(|existing| {
                catalog
                    .devices
                    .get(existing)
                    .is_some_and(|d| sort_key(d) > key)
            })
            .unwrap_or(catalog.ordered.len());
        catalog.ordered.insert(position, id);
        catalog.devices.insert(id, Arc::clone(&device));

        Ok(id)
    }

    /// Materialize and add a device from static configuration.
    pub async fn add_device_config(&self, config: &DeviceConfig) -> SdkResult<Uuid> {
        let mut device = Device::new(&config.device_type, &config.handler)
            .with_info(&config.info)
            .with_data_map(config.data.clone())
            .with_sort_index(config.sort_index)
            .with_write_timeout(
                config
                    .write_timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(self.default_write_timeout),
            );
        for (key, value) in &config.metadata {
            device = device.with_metadata(key, value);
        }
        for tag in &config.tags {
            device = device.with_tag(Tag::parse(tag)?);
        }
        if let Some(alias) = &config.alias {
            device = device.with_alias(alias);
        }
        if let Some(factor) = config.scaling_factor {
            device = device.with_scaling_factor(factor);
        }
        self.add_device(device).await
    }

    /// Run the dynamic registration hooks over each config entry, honoring
    /// the dynamic-registration policy.
    pub async fn register_dynamic(
        &self,
        settings: &DynamicRegistrationSettings,
        policy: ConfigPolicy,
    ) -> SdkResult<usize> {
        if settings.config.is_empty() {
            if policy == ConfigPolicy::Required {
                return Err(SdkError::Config(
                    "dynamic registration is required but no config was provided".into(),
                ));
            }
            return Ok(0);
        }
        if policy == ConfigPolicy::Prohibited {
            return Err(SdkError::Config(
                "dynamic registration config present but prohibited by policy".into(),
            ));
        }

        let mut registered = 0;
        for entry in &settings.config {
            match self.register_dynamic_entry(entry).await {
                Ok(count) => registered += count,
                Err(e) if policy == ConfigPolicy::Required => {
                    return Err(SdkError::Fatal(format!(
                        "required dynamic registration failed: {}",
                        e
                    )));
                }
                Err(e) => {
                    warn!(error = %e, "dynamic registration entry failed; skipping");
                }
            }
        }
        Ok(registered)
    }

    async fn register_dynamic_entry(
        &self,
        entry: &serde_json::Map<String, serde_json::Value>,
    ) -> SdkResult<usize> {
        let mut registered = 0;
        if let Some(hook) = &self.hooks.dynamic_config {
            for config in hook(entry)? {
                self.add_device_config(&config).await?;
                registered += 1;
            }
        }
        if let Some(hook) = &self.hooks.dynamic_devices {
            for device in hook(entry)? {
                self.add_device(device).await?;
                registered += 1;
            }
        }
        Ok(registered)
    }

    /// O(1) lookup by canonical id.
    pub async fn get_device(&self, id: &Uuid) -> Option<Arc<Device>> {
        self.catalog.read().await.devices.get(id).cloned()
    }

    /// Resolve a wire id: a canonical UUID string or an alias.
    pub async fn resolve(&self, id_or_alias: &str) -> Option<Arc<Device>> {
        let catalog = self.catalog.read().await;
        if let Ok(id) = Uuid::parse_str(id_or_alias) {
            if let Some(device) = catalog.devices.get(&id) {
                return Some(Arc::clone(device));
            }
        }
        catalog
            .alias_index
            .get(id_or_alias)
            .and_then(|id| catalog.devices.get(id))
            .cloned()
    }

    /// Evaluate a selector against the catalog.
    ///
    /// An id selects exactly one device or fails with not-found; tags select
    /// the intersection of their tag-index entries; an empty selector selects
    /// everything. Results are in catalog order.
    pub async fn get_devices(&self, selector: &DeviceSelector) -> SdkResult<Vec<Arc<Device>>> {
        if let Some(id) = &selector.id {
            if !selector.tags.is_empty() {
                warn!(id = %id, "selector has both id and tags; ignoring tags");
            }
            let device = self
                .resolve(id)
                .await
                .ok_or_else(|| SdkError::NotFound(format!("device {}", id)))?;
            return Ok(vec![device]);
        }

        let catalog = self.catalog.read().await;
        if selector.tags.is_empty() {
            return Ok(catalog
                .ordered
                .iter()
                .filter_map(|id| catalog.devices.get(id).cloned())
                .collect());
        }

        let mut matched: Option<HashSet<Uuid>> = None;
        for tag in &selector.tags {
            let ids = catalog.tag_index.get(tag).cloned().unwrap_or_default();
            matched = Some(match matched {
                Some(acc) => acc.intersection(&ids).copied().collect(),
                None => ids,
            });
            if matched.as_ref().is_some_and(HashSet::is_empty) {
                return Ok(Vec::new());
            }
        }
        let matched = matched.unwrap_or_default();
        Ok(catalog
            .ordered
            .iter()
            .filter(|id| matched.contains(id))
            .filter_map(|id| catalog.devices.get(id).cloned())
            .collect())
    }

    /// Devices matching an additive filter, in catalog order.
    pub async fn filter_devices(&self, filter: &DeviceFilter) -> Vec<Arc<Device>> {
        let catalog = self.catalog.read().await;
        catalog
            .ordered
            .iter()
            .filter_map(|id| catalog.devices.get(id).cloned())
            .filter(|device| filter.matches(device))
            .collect()
    }

    /// Every device, in catalog order.
    pub async fn devices(&self) -> Vec<Arc<Device>> {
        let catalog = self.catalog.read().await;
        catalog
            .ordered
            .iter()
            .filter_map(|id| catalog.devices.get(id).cloned())
            .collect()
    }

    /// Devices bound to the named handler, in catalog order.
    pub async fn devices_for_handler(&self, handler: &str) -> Vec<Arc<Device>> {
        let catalog = self.catalog.read().await;
        let Some(ids) = catalog.handler_index.get(handler) else {
            return Vec::new();
        };
        catalog
            .ordered
            .iter()
            .filter(|id| ids.contains(id))
            .filter_map(|id| catalog.devices.get(id).cloned())
            .collect()
    }

    /// Names of all registered handlers.
    pub async fn handler_names(&self) -> Vec<String> {
        self.handlers.read().await.keys().cloned().collect()
    }

    pub async fn device_count(&self) -> usize {
        self.catalog.read().await.devices.len()
    }

    /// Queue device-setup actions; each must carry a non-empty filter.
    pub async fn add_device_setup_actions(
        &self,
        actions: Vec<Arc<dyn DeviceSetupAction>>,
    ) -> SdkResult<()> {
        for action in &actions {
            if action.filter().is_empty() {
                return Err(SdkError::InvalidArgument(format!(
                    "device setup action '{}' has an empty filter",
                    action.name()
                )));
            }
        }
        self.setup_actions.write().await.extend(actions);
        Ok(())
    }

    /// Run the queued setup actions over their filtered devices. Per-device
    /// failures accumulate; a failure never aborts the phase.
    pub async fn start(&self) -> Result<(), MultiError> {
        let actions: Vec<Arc<dyn DeviceSetupAction>> =
            self.setup_actions.read().await.iter().cloned().collect();
        let mut collected = MultiError::new();

        for action in actions {
            let devices = self.filter_devices(&action.filter()).await;
            debug!(
                action = action.name(),
                devices = devices.len(),
                "running device setup action"
            );
            for device in devices {
                if let Err(e) = action.run(&device).await {
                    warn!(
                        action = action.name(),
                        device = %device.id(),
                        error = %e,
                        "device setup action failed"
                    );
                    collected.push(SdkError::Transient(format!(
                        "setup action '{}' failed for device {}: {}",
                        action.name(),
                        device.id(),
                        e
                    )));
                }
            }
        }

        if collected.is_empty() {
            info!("device setup actions complete");
        }
        collected.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IdentitySettings, PluginMetadata};
    use crate::device::Capabilities;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TestHandler {
        name: &'static str,
        caps: Capabilities,
    }

    #[async_trait]
    impl DeviceHandler for TestHandler {
        fn name(&self) -> &str {
            self.name
        }

        fn capabilities(&self) -> Capabilities {
            self.caps
        }
    }

    fn manager() -> DeviceManager {
        manager_with_hooks(DeviceHooks::default())
    }

    fn manager_with_hooks(hooks: DeviceHooks) -> DeviceManager {
        let id = PluginId::new(
            &IdentitySettings::default(),
            &PluginMetadata::new("test", "neoplug"),
        )
        .unwrap();
        DeviceManager::new(id, Duration::from_secs(30), hooks)
    }

    fn read_handler(name: &'static str) -> Arc<dyn DeviceHandler> {
        Arc::new(TestHandler {
            name,
            caps: Capabilities::new().read(),
        })
    }

    #[tokio::test]
    async fn test_add_handler_rejects_duplicates() {
        let mgr = manager();
        mgr.add_handler(read_handler("modbus")).await.unwrap();
        let err = mgr.add_handler(read_handler("modbus")).await.unwrap_err();
        assert!(matches!(err, SdkError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_add_handler_rejects_no_capabilities() {
        let mgr = manager();
        let handler = Arc::new(TestHandler {
            name: "inert",
            caps: Capabilities::new(),
        });
        let err = mgr.add_handler(handler).await.unwrap_err();
        assert!(matches!(err, SdkError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_add_device_assigns_deterministic_id_and_auto_tags() {
        let mgr = manager();
        mgr.add_handler(read_handler("modbus")).await.unwrap();

        let device = Device::new("temperature", "modbus")
            .with_data("address", serde_json::json!(12));
        let id = mgr.add_device(device).await.unwrap();

        let device = mgr.get_device(&id).await.unwrap();
        assert_eq!(device.id(), id);
        assert_eq!(device.id_name(), "temperature.modbus.12");
        assert!(device.tags.contains(&Tag::device_id(&id)));
        assert!(device.tags.contains(&Tag::device_type("temperature")));
        assert!(device.handler().is_ok());

        // Same config on a fresh manager derives the same id.
        let mgr2 = manager();
        mgr2.add_handler(read_handler("modbus")).await.unwrap();
        let id2 = mgr2
            .add_device(Device::new("temperature", "modbus").with_data("address", serde_json::json!(12)))
            .await
            .unwrap();
        assert_eq!(id, id2);
    }

    #[tokio::test]
    async fn test_add_device_requires_registered_handler() {
        let mgr = manager();
        let err = mgr
            .add_device(Device::new("temperature", "missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, SdkError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_duplicate_id_is_conflict() {
        let mgr = manager();
        mgr.add_handler(read_handler("modbus")).await.unwrap();

        let make = || Device::new("temperature", "modbus").with_data("address", serde_json::json!(1));
        mgr.add_device(make()).await.unwrap();
        let err = mgr.add_device(make()).await.unwrap_err();
        assert!(matches!(err, SdkError::Conflict(_)));
        assert_eq!(mgr.device_count().await, 1);
    }

    #[tokio::test]
    async fn test_alias_conflict() {
        let mgr = manager();
        mgr.add_handler(read_handler("modbus")).await.unwrap();

        mgr.add_device(
            Device::new("temperature", "modbus")
                .with_data("address", serde_json::json!(1))
                .with_alias("probe"),
        )
        .await
        .unwrap();
        let err = mgr
            .add_device(
                Device::new("temperature", "modbus")
                    .with_data("address", serde_json::json!(2))
                    .with_alias("probe"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SdkError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_validator_hook_failures_reject_device() {
        let hooks = DeviceHooks {
            validator: Some(Arc::new(|device: &Device| {
                if device.data.contains_key("address") {
                    Ok(())
                } else {
                    Err(SdkError::InvalidArgument("address is required".into()))
                }
            })),
            ..Default::default()
        };
        let mgr = manager_with_hooks(hooks);
        mgr.add_handler(read_handler("modbus")).await.unwrap();

        let err = mgr
            .add_device(Device::new("temperature", "modbus"))
            .await
            .unwrap_err();
        assert!(matches!(err, SdkError::InvalidArgument(_)));

        mgr.add_device(
            Device::new("temperature", "modbus").with_data("address", serde_json::json!(3)),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_authored_system_tags_rejected() {
        let mgr = manager();
        mgr.add_handler(read_handler("modbus")).await.unwrap();
        let device =
            Device::new("temperature", "modbus").with_tag(Tag::new("system", "sneaky"));
        let err = mgr.add_device(device).await.unwrap_err();
        assert!(matches!(err, SdkError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_selector_by_id_and_alias() {
        let mgr = manager();
        mgr.add_handler(read_handler("modbus")).await.unwrap();
        let id = mgr
            .add_device(
                Device::new("temperature", "modbus")
                    .with_data("address", serde_json::json!(1))
                    .with_alias("inlet"),
            )
            .await
            .unwrap();

        let by_id = mgr
            .get_devices(&DeviceSelector::by_id(id.to_string()))
            .await
            .unwrap();
        assert_eq!(by_id.len(), 1);

        let by_alias = mgr
            .get_devices(&DeviceSelector::by_id("inlet"))
            .await
            .unwrap();
        assert_eq!(by_alias[0].id(), id);

        let err = mgr
            .get_devices(&DeviceSelector::by_id("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, SdkError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_selector_by_tags_is_conjunctive() {
        let mgr = manager();
        mgr.add_handler(read_handler("modbus")).await.unwrap();

        mgr.add_device(
            Device::new("temperature", "modbus")
                .with_data("address", serde_json::json!(1))
                .with_tag(Tag::parse("site/zone:a").unwrap())
                .with_tag(Tag::parse("rack:r1").unwrap()),
        )
        .await
        .unwrap();
        mgr.add_device(
            Device::new("temperature", "modbus")
                .with_data("address", serde_json::json!(2))
                .with_tag(Tag::parse("site/zone:a").unwrap()),
        )
        .await
        .unwrap();

        let zone = mgr
            .get_devices(&DeviceSelector::by_tags([Tag::parse("site/zone:a").unwrap()]))
            .await
            .unwrap();
        assert_eq!(zone.len(), 2);

        let both = mgr
            .get_devices(&DeviceSelector::by_tags([
                Tag::parse("site/zone:a").unwrap(),
                Tag::parse("rack:r1").unwrap(),
            ]))
            .await
            .unwrap();
        assert_eq!(both.len(), 1);

        let none = mgr
            .get_devices(&DeviceSelector::by_tags([Tag::parse("rack:r9").unwrap()]))
            .await
            .unwrap();
        assert!(none.is_empty());

        let all = mgr.get_devices(&DeviceSelector::all()).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_catalog_order_respects_sort_index() {
        let mgr = manager();
        mgr.add_handler(read_handler("modbus")).await.unwrap();

        mgr.add_device(
            Device::new("temperature", "modbus")
                .with_data("address", serde_json::json!(1))
                .with_sort_index(5),
        )
        .await
        .unwrap();
        mgr.add_device(
            Device::new("temperature", "modbus")
                .with_data("address", serde_json::json!(2))
                .with_sort_index(1),
        )
        .await
        .unwrap();

        let ordered = mgr.devices().await;
        assert_eq!(ordered[0].sort_index, 1);
        assert_eq!(ordered[1].sort_index, 5);
    }

    #[tokio::test]
    async fn test_filter_devices_union_and_wildcard() {
        let mgr = manager();
        mgr.add_handler(read_handler("modbus")).await.unwrap();
        mgr.add_device(
            Device::new("temperature", "modbus").with_data("address", serde_json::json!(1)),
        )
        .await
        .unwrap();
        mgr.add_device(Device::new("fan", "modbus").with_data("address", serde_json::json!(2)))
            .await
            .unwrap();

        let temps = mgr.filter_devices(&DeviceFilter::types(["temperature"])).await;
        assert_eq!(temps.len(), 1);

        let all = mgr.filter_devices(&DeviceFilter::types(["*"])).await;
        assert_eq!(all.len(), 2);

        let union = mgr
            .filter_devices(&DeviceFilter::types(["temperature", "fan"]))
            .await;
        assert_eq!(union.len(), 2);
    }

    struct CountingAction {
        filter: DeviceFilter,
        runs: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl DeviceSetupAction for CountingAction {
        fn name(&self) -> &str {
            "counting"
        }

        fn filter(&self) -> DeviceFilter {
            self.filter.clone()
        }

        async fn run(&self, _device: &Device) -> SdkResult<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(SdkError::Transient("setup failed".into()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_setup_actions_require_filter() {
        let mgr = manager();
        let action = Arc::new(CountingAction {
            filter: DeviceFilter::new(),
            runs: Arc::new(AtomicUsize::new(0)),
            fail: false,
        });
        let err = mgr
            .add_device_setup_actions(vec![action])
            .await
            .unwrap_err();
        assert!(matches!(err, SdkError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_setup_actions_accumulate_failures() {
        let mgr = manager();
        mgr.add_handler(read_handler("modbus")).await.unwrap();
        for i in 0..3 {
            mgr.add_device(
                Device::new("temperature", "modbus").with_data("address", serde_json::json!(i)),
            )
            .await
            .unwrap();
        }

        let runs = Arc::new(AtomicUsize::new(0));
        let action = Arc::new(CountingAction {
            filter: DeviceFilter::types(["temperature"]),
            runs: Arc::clone(&runs),
            fail: true,
        });
        mgr.add_device_setup_actions(vec![action]).await.unwrap();

        // Every device is visited despite each run failing.
        let err = mgr.start().await.unwrap_err();
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(err.len(), 3);
    }

    #[tokio::test]
    async fn test_dynamic_registration_policies() {
        let hooks = DeviceHooks {
            dynamic_devices: Some(Arc::new(|entry| {
                let count = entry
                    .get("count")
                    .and_then(serde_json::Value::as_u64)
                    .ok_or_else(|| SdkError::Config("count missing".into()))?;
                Ok((0..count)
                    .map(|i| {
                        Device::new("temperature", "modbus")
                            .with_data("address", serde_json::json!(i))
                    })
                    .collect())
            })),
            ..Default::default()
        };
        let mgr = manager_with_hooks(hooks);
        mgr.add_handler(read_handler("modbus")).await.unwrap();

        let mut good = serde_json::Map::new();
        good.insert("count".into(), serde_json::json!(2));
        let bad = serde_json::Map::new();

        let settings = DynamicRegistrationSettings {
            config: vec![bad.clone(), good.clone()],
        };

        // Optional policy skips the failing entry.
        let registered = mgr
            .register_dynamic(&settings, ConfigPolicy::Optional)
            .await
            .unwrap();
        assert_eq!(registered, 2);

        // Required policy propagates the failure.
        let mgr = manager_with_hooks(DeviceHooks {
            dynamic_devices: Some(Arc::new(|_| {
                Err(SdkError::Config("nope".into()))
            })),
            ..Default::default()
        });
        let err = mgr
            .register_dynamic(
                &DynamicRegistrationSettings { config: vec![good] },
                ConfigPolicy::Required,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SdkError::Fatal(_)));
    }
}

