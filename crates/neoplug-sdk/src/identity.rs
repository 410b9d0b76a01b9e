//! Deterministic plugin and device identity.
//!
//! The plugin namespace is a version-5 UUID rooted at the DNS namespace,
//! computed over an ordered concatenation of ingredients chosen by the
//! identity settings. Device ids are v5 UUIDs under that plugin namespace,
//! so a device keeps its id across restarts as long as its configuration is
//! unchanged.

use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::{IdentitySettings, PluginMetadata};
use crate::error::{SdkError, SdkResult};

const MACHINE_ID_PATHS: [&str; 2] = ["/etc/machine-id", "/var/lib/dbus/machine-id"];

/// The deterministic identity of a plugin instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginId {
    uuid: Uuid,
    name: String,
}

impl PluginId {
    /// Compose the plugin namespace from the configured ingredients.
    ///
    /// Ingredient order is fixed: plugin tag, machine-id digest, environment
    /// values, custom strings. Fails with a configuration error when no
    /// ingredient yields a non-empty value, or when a referenced environment
    /// variable is unset.
    pub fn new(settings: &IdentitySettings, metadata: &PluginMetadata) -> SdkResult<Self> {
        let mut name = String::new();

        if settings.use_plugin_tag {
            name.push_str(&metadata.tag());
        }
        if settings.use_machine_id {
            name.push_str(&machine_id_digest(&metadata.tag())?);
        }
        for var in &settings.use_env {
            let value = std::env::var(var).map_err(|_| {
                SdkError::Config(format!(
                    "identity references environment variable '{}' which is not set",
                    var
                ))
            })?;
            name.push_str(&value);
        }
        for custom in &settings.use_custom {
            name.push_str(custom);
        }

        if name.is_empty() {
            return Err(SdkError::Config(
                "plugin identity requires at least one non-empty ingredient".into(),
            ));
        }

        Ok(Self {
            uuid: Uuid::new_v5(&Uuid::NAMESPACE_DNS, name.as_bytes()),
            name,
        })
    }

    /// The plugin namespace UUID.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// The composed namespace name the UUID was derived from.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// A v5 UUID under the plugin namespace; the canonical device id.
    pub fn namespaced_id(&self, name: &str) -> Uuid {
        Uuid::new_v5(&self.uuid, name.as_bytes())
    }
}

impl std::fmt::Display for PluginId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.uuid)
    }
}

/// Digest of the host machine id, salted by the plugin tag so two plugins on
/// one host do not share an ingredient.
fn machine_id_digest(tag: &str) -> SdkResult<String> {
    let machine_id = read_machine_id()?;
    let mut hasher = Sha256::new();
    hasher.update(tag.as_bytes());
    hasher.update(b":");
    hasher.update(machine_id.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

fn read_machine_id() -> SdkResult<String> {
    for path in MACHINE_ID_PATHS {
        if let Ok(contents) = std::fs::read_to_string(path) {
            let trimmed = contents.trim();
            if !trimmed.is_empty() {
                return Ok(trimmed.to_string());
            }
        }
    }
    // Hosts without a machine-id file (containers, macOS) fall back to the
    // hostname, which is stable enough for identity purposes.
    let host = hostname::get()
        .map_err(|e| SdkError::Config(format!("unable to determine machine id: {}", e)))?;
    let host = host.to_string_lossy();
    if host.is_empty() {
        return Err(SdkError::Config(
            "unable to determine machine id: empty hostname".into(),
        ));
    }
    Ok(host.into_owned())
}

/// The default device-identifier hook.
///
/// Concatenates the scalar values of the device data map in
/// lexicographically-sorted key order. Nested maps are skipped so that map
/// iteration order can never leak into the identity.
pub fn default_device_identifier(data: &serde_json::Map<String, Value>) -> String {
    let mut keys: Vec<&String> = data.keys().collect();
    keys.sort();

    let mut out = String::new();
    for key in keys {
        match &data[key.as_str()] {
            Value::Object(_) => continue,
            Value::String(s) => out.push_str(s),
            value => out.push_str(&value.to_string()),
        }
    }
    out
}

/// The canonical device id name: `<type>.<handler>.<identifier>`.
pub fn device_id_name(device_type: &str, handler: &str, identifier: &str) -> String {
    [device_type, handler, identifier].join(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag_only_settings() -> IdentitySettings {
        IdentitySettings {
            use_plugin_tag: true,
            use_machine_id: false,
            use_env: Vec::new(),
            use_custom: Vec::new(),
        }
    }

    #[test]
    fn test_plugin_id_from_tag() {
        let metadata = PluginMetadata::new("foo", "bar");
        let id = PluginId::new(&tag_only_settings(), &metadata).unwrap();

        assert_eq!(id.name(), "bar/foo");
        assert_eq!(
            id.uuid().to_string(),
            "1d916ec2-f015-5f3e-869d-36ef30dce23f"
        );
    }

    #[test]
    fn test_namespaced_id() {
        let metadata = PluginMetadata::new("foo", "bar");
        let id = PluginId::new(&tag_only_settings(), &metadata).unwrap();

        assert_eq!(
            id.namespaced_id("foo").to_string(),
            "3356863c-1adf-5d27-a6c2-8ab41cf816d0"
        );
    }

    #[test]
    fn test_plugin_id_deterministic() {
        let metadata = PluginMetadata::new("foo", "bar");
        let a = PluginId::new(&tag_only_settings(), &metadata).unwrap();
        let b = PluginId::new(&tag_only_settings(), &metadata).unwrap();
        assert_eq!(a, b);
        assert_eq!(
            a.namespaced_id("device-1"),
            b.namespaced_id("device-1")
        );
    }

    #[test]
    fn test_plugin_id_custom_ingredients() {
        let settings = IdentitySettings {
            use_plugin_tag: false,
            use_machine_id: false,
            use_env: Vec::new(),
            use_custom: vec!["alpha".into(), "beta".into()],
        };
        let id = PluginId::new(&settings, &PluginMetadata::default()).unwrap();
        assert_eq!(id.name(), "alphabeta");
    }

    #[test]
    fn test_plugin_id_requires_ingredient() {
        let settings = IdentitySettings {
            use_plugin_tag: false,
            use_machine_id: false,
            use_env: Vec::new(),
            use_custom: Vec::new(),
        };
        let err = PluginId::new(&settings, &PluginMetadata::default()).unwrap_err();
        assert!(matches!(err, SdkError::Config(_)));
    }

    #[test]
    fn test_plugin_id_missing_env_is_fatal() {
        let settings = IdentitySettings {
            use_plugin_tag: true,
            use_machine_id: false,
            use_env: vec!["NEOPLUG_TEST_UNSET_VARIABLE".into()],
            use_custom: Vec::new(),
        };
        let err = PluginId::new(&settings, &PluginMetadata::new("foo", "bar")).unwrap_err();
        assert!(matches!(err, SdkError::Config(_)));
    }

    #[test]
    fn test_default_identifier_sorted_scalars() {
        let data: serde_json::Map<String, Value> = serde_json::from_str(
            r#"{"foo": "bar", "baz": 1, "bool": true}"#,
        )
        .unwrap();
        assert_eq!(default_device_identifier(&data), "1truebar");
    }

    #[test]
    fn test_default_identifier_skips_nested_maps() {
        let data: serde_json::Map<String, Value> = serde_json::from_str(
            r#"{"a": "x", "nested": {"k": "v"}, "b": 2}"#,
        )
        .unwrap();
        assert_eq!(default_device_identifier(&data), "x2");
    }

    #[test]
    fn test_device_id_name() {
        assert_eq!(
            device_id_name("temperature", "modbus", "12"),
            "temperature.modbus.12"
        );
    }
}
