//! Parsed plugin configuration.
//!
//! The SDK consumes already-parsed configuration objects; reading YAML files
//! off disk belongs to the loader in front of it. The loader resolves its
//! search paths (`.`, `./config`, `/etc/neoplug/config`) and honors the
//! environment overrides published here, then hands these structs to
//! [`Plugin::new`](crate::plugin::Plugin::new).

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variable overriding the plugin config search path.
pub const ENV_PLUGIN_CONFIG: &str = "PLUGIN_CONFIG";

/// Environment variable overriding the device config search path.
pub const ENV_DEVICE_CONFIG: &str = "PLUGIN_DEVICE_CONFIG";

/// Port the metrics collaborator binds when [`MetricsSettings::enabled`] is set.
pub const METRICS_PORT: u16 = 2112;

/// Static plugin identity supplied by the plugin author.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginMetadata {
    /// Plugin name, e.g. `emulator`.
    pub name: String,
    /// Maintainer, e.g. `vaporio`.
    pub maintainer: String,
    /// Short human-readable description.
    #[serde(default)]
    pub description: String,
    /// Source repository URL.
    #[serde(default)]
    pub vcs: String,
}

impl PluginMetadata {
    pub fn new(name: impl Into<String>, maintainer: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            maintainer: maintainer.into(),
            description: String::new(),
            vcs: String::new(),
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the VCS URL.
    pub fn with_vcs(mut self, vcs: impl Into<String>) -> Self {
        self.vcs = vcs.into();
        self
    }

    /// The normalized plugin tag, `<maintainer>/<name>`.
    ///
    /// Lowercased; literal dashes become underscores, then spaces become
    /// dashes.
    pub fn tag(&self) -> String {
        let tag = format!("{}/{}", self.maintainer, self.name);
        tag.to_lowercase().replace('-', "_").replace(' ', "-")
    }
}

/// How strictly a configuration source is treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigPolicy {
    /// Missing or failing source aborts startup.
    Required,
    /// Missing or failing source is logged and skipped.
    #[default]
    Optional,
    /// The source must not be present at all.
    Prohibited,
}

/// Policies for each configuration source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySettings {
    pub plugin_config: ConfigPolicy,
    pub device_config: ConfigPolicy,
    pub dynamic_config: ConfigPolicy,
    /// Governs pre-run and device-setup action failures.
    pub startup_actions: ConfigPolicy,
}

/// Ingredients composed into the deterministic plugin namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentitySettings {
    /// Include the normalized plugin tag.
    pub use_plugin_tag: bool,
    /// Include the salted machine-id digest of the host.
    pub use_machine_id: bool,
    /// Include the values of these environment variables; each must be set.
    pub use_env: Vec<String>,
    /// Include these literal strings.
    pub use_custom: Vec<String>,
}

impl Default for IdentitySettings {
    fn default() -> Self {
        Self {
            use_plugin_tag: true,
            use_machine_id: false,
            use_env: Vec::new(),
            use_custom: Vec::new(),
        }
    }
}

/// Read loop scheduling mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadMode {
    /// One iteration reads each device sequentially in catalog order.
    #[default]
    Serial,
    /// One worker per device (or bulk group) per iteration.
    Parallel,
}

/// Read loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadSettings {
    /// Whether scheduled reads run at all.
    pub enabled: bool,
    /// Scheduling mode.
    pub mode: ReadMode,
    /// Read iteration cadence in milliseconds.
    pub interval_ms: u64,
    /// Capacity of the reading publication channel.
    pub channel_size: usize,
    /// How long a producer may wait for a free publication slot, in
    /// milliseconds, before the reading is discarded.
    pub admission_timeout_ms: u64,
    /// Ring size of the per-device reading cache.
    pub cache_size: usize,
}

impl Default for ReadSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: ReadMode::Serial,
            interval_ms: 1_000,
            channel_size: 100,
            admission_timeout_ms: 1_000,
            cache_size: 100,
        }
    }
}

impl ReadSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn admission_timeout(&self) -> Duration {
        Duration::from_millis(self.admission_timeout_ms)
    }
}

/// Write loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteSettings {
    /// Whether writes are accepted at all.
    pub enabled: bool,
    /// Capacity of the shared write queue.
    pub queue_size: usize,
    /// Maximum concurrent write executions across all devices.
    pub workers: usize,
    /// Consecutive writes one worker drains for a single device before
    /// yielding its slot.
    pub max_per_worker: usize,
    /// How long an enqueue may wait for a free queue slot, in milliseconds,
    /// before the request is rejected with queue-full.
    pub admission_timeout_ms: u64,
    /// Default per-device write timeout in milliseconds; a device may
    /// override it.
    pub timeout_ms: u64,
}

impl Default for WriteSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            queue_size: 100,
            workers: 4,
            max_per_worker: 8,
            admission_timeout_ms: 1_000,
            timeout_ms: 30_000,
        }
    }
}

impl WriteSettings {
    pub fn admission_timeout(&self) -> Duration {
        Duration::from_millis(self.admission_timeout_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenSettings {
    /// Whether listeners are spawned at all.
    pub enabled: bool,
    /// Delay before restarting a failed listener, in milliseconds.
    pub restart_backoff_ms: u64,
    /// Consecutive failures after which a listener is abandoned.
    pub max_restarts: usize,
}

impl Default for ListenSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            restart_backoff_ms: 1_000,
            max_restarts: 10,
        }
    }
}

impl ListenSettings {
    pub fn restart_backoff(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_ms)
    }
}

/// Transaction store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionSettings {
    /// Maximum retained transactions.
    pub capacity: usize,
    /// Retention of terminal transactions, in seconds.
    pub ttl_secs: u64,
    /// Sweep cadence, in seconds.
    pub sweep_interval_secs: u64,
}

impl Default for TransactionSettings {
    fn default() -> Self {
        Self {
            capacity: 256,
            ttl_secs: 300,
            sweep_interval_secs: 30,
        }
    }
}

impl TransactionSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Health check settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    /// Whether the built-in checks are registered.
    pub checks_enabled: bool,
    /// Default check cadence in seconds.
    pub interval_secs: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            checks_enabled: true,
            interval_secs: 30,
        }
    }
}

impl HealthSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Metrics exposure knob; serving `/metrics` belongs to a collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    pub enabled: bool,
}

/// Dynamic registration parameters, one opaque map per invocation of the
/// registrar hooks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamicRegistrationSettings {
    pub config: Vec<serde_json::Map<String, serde_json::Value>>,
}

/// Plugin shutdown settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownSettings {
    /// Grace period for draining the write queue on stop, in milliseconds.
    pub grace_period_ms: u64,
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            grace_period_ms: 5_000,
        }
    }
}

impl ShutdownSettings {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

/// Top-level plugin settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginSettings {
    pub id: IdentitySettings,
    pub policies: PolicySettings,
    pub read: ReadSettings,
    pub write: WriteSettings,
    pub listen: ListenSettings,
    pub transaction: TransactionSettings,
    pub health: HealthSettings,
    pub metrics: MetricsSettings,
    pub dynamic_registration: DynamicRegistrationSettings,
    pub shutdown: ShutdownSettings,
}

/// One device instance from static configuration.
///
/// Tags use the string form (`namespace/annotation:label`); transforms beyond
/// the scaling factor cannot be expressed in static config and are attached
/// through the device builder instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device type, e.g. `temperature`.
    #[serde(rename = "type")]
    pub device_type: String,
    /// Name of the handler that services this device.
    pub handler: String,
    /// Human-readable description.
    #[serde(default)]
    pub info: String,
    /// Arbitrary string metadata.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// User-authored tags in string form.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Opaque protocol data handed to the handler.
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
    /// Optional human-friendly alias; must be unique across the plugin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// Optional multiplier applied to numeric readings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scaling_factor: Option<f64>,
    /// Per-device write timeout override, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_timeout_ms: Option<u64>,
    /// Sort weight within the catalog; lower sorts first.
    #[serde(default)]
    pub sort_index: i32,
}
