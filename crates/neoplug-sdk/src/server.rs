//! The RPC surface: a transport-agnostic adapter over the core components.
//!
//! A transport binding (gRPC, HTTP) owns the wire format; this layer accepts
//! selectors and ids, resolves aliases, and returns domain objects. Device
//! ids on the wire are canonical UUID strings; an alias is accepted anywhere
//! an id is.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::cache::ReadingCache;
use crate::config::PluginMetadata;
use crate::device::{Capabilities, Device, WriteData};
use crate::error::{SdkError, SdkResult};
use crate::health::{HealthRegistry, HealthSnapshot};
use crate::identity::PluginId;
use crate::manager::{DeviceManager, DeviceSelector};
use crate::reading::Reading;
use crate::scheduler::DataManager;
use crate::transaction::{Transaction, TransactionStore};

/// Build-time version snapshot served by the metadata query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub sdk_version: String,
    pub build_profile: String,
    pub os: String,
    pub arch: String,
}

impl VersionInfo {
    pub fn current() -> Self {
        Self {
            sdk_version: crate::VERSION.to_string(),
            build_profile: crate::BUILD_PROFILE.to_string(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }
}

/// Response of the metadata query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
    pub maintainer: String,
    pub description: String,
    pub vcs: String,
    /// Normalized plugin tag, `<maintainer>/<name>`.
    pub tag: String,
    /// Plugin namespace UUID.
    pub id: String,
    pub version: VersionInfo,
}

/// Wire view of a catalog entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(rename = "type")]
    pub device_type: String,
    pub info: String,
    pub metadata: std::collections::HashMap<String, String>,
    /// Tag strings in canonical form.
    pub tags: Vec<String>,
    pub capabilities: Capabilities,
    pub handler: String,
    pub sort_index: i32,
}

impl DeviceSnapshot {
    fn from_device(device: &Device) -> Self {
        Self {
            id: device.id().to_string(),
            alias: device.alias.clone(),
            device_type: device.device_type.clone(),
            info: device.info.clone(),
            metadata: device.metadata.clone(),
            tags: device.tags.iter().map(|t| t.to_string()).collect(),
            capabilities: device.capabilities(),
            handler: device.handler_name.clone(),
            sort_index: device.sort_index,
        }
    }
}

/// A subscription to the broadcast reading channel, filtered to the devices
/// a selector matched at subscribe time.
pub struct ReadingStream {
    rx: broadcast::Receiver<Reading>,
    /// Empty means every device.
    devices: HashSet<Uuid>,
    stopped: tokio_util::sync::CancellationToken,
}

impl ReadingStream {
    /// The next matching reading, or `None` once the plugin stops.
    ///
    /// A slow consumer may lag behind the channel; lagged readings are
    /// skipped and the stream continues with the oldest retained one.
    pub async fn recv(&mut self) -> Option<Reading> {
        loop {
            tokio::select! {
                _ = self.stopped.cancelled() => return None,
                result = self.rx.recv() => match result {
                    Ok(reading) => {
                        if self.devices.is_empty() || self.devices.contains(&reading.device) {
                            return Some(reading);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
            }
        }
    }
}

/// The operations the control plane invokes against a plugin.
pub struct PluginServer {
    metadata: PluginMetadata,
    id: PluginId,
    devices: Arc<DeviceManager>,
    scheduler: Arc<DataManager>,
    transactions: Arc<TransactionStore>,
    cache: Arc<ReadingCache>,
    health: Arc<HealthRegistry>,
}

impl PluginServer {
    pub(crate) fn new(
        metadata: PluginMetadata,
        id: PluginId,
        devices: Arc<DeviceManager>,
        scheduler: Arc<DataManager>,
        transactions: Arc<TransactionStore>,
        cache: Arc<ReadingCache>,
        health: Arc<HealthRegistry>,
    ) -> Self {
        Self {
            metadata,
            id,
            devices,
            scheduler,
            transactions,
            cache,
            health,
        }
    }

    /// Plugin tag, identity, and version snapshot.
    pub fn metadata(&self) -> Metadata {
        Metadata {
            name: self.metadata.name.clone(),
            maintainer: self.metadata.maintainer.clone(),
            description: self.metadata.description.clone(),
            vcs: self.metadata.vcs.clone(),
            tag: self.metadata.tag(),
            id: self.id.uuid().to_string(),
            version: VersionInfo::current(),
        }
    }

    /// Human-readable version block for `--version`.
    pub fn version_block(&self) -> String {
        let version = VersionInfo::current();
        format!(
            "{} ({})\n sdk version: {}\n build profile: {}\n os/arch: {}/{}",
            self.metadata.tag(),
            self.id.uuid(),
            version.sdk_version,
            version.build_profile,
            version.os,
            version.arch,
        )
    }

    /// Catalog entries matching a selector.
    pub async fn devices(&self, selector: &DeviceSelector) -> SdkResult<Vec<DeviceSnapshot>> {
        let devices = self.devices.get_devices(selector).await?;
        Ok(devices
            .iter()
            .map(|device| DeviceSnapshot::from_device(device))
            .collect())
    }

    /// Most-recent cached readings for the devices a selector matches.
    pub async fn read(&self, selector: &DeviceSelector) -> SdkResult<Vec<Reading>> {
        let devices = self.devices.get_devices(selector).await?;
        let mut readings = Vec::new();
        for device in devices {
            readings.extend(self.cache.latest(&device.id()));
        }
        Ok(readings)
    }

    /// Subscribe to readings for the devices a selector matches.
    pub async fn read_stream(&self, selector: &DeviceSelector) -> SdkResult<ReadingStream> {
        let devices = if selector.is_empty() {
            HashSet::new()
        } else {
            self.devices
                .get_devices(selector)
                .await?
                .iter()
                .map(|device| device.id())
                .collect()
        };
        Ok(ReadingStream {
            rx: self.scheduler.subscribe(),
            devices,
            stopped: self.scheduler.cancel_token(),
        })
    }

    /// Validate writability, create transactions, and enqueue the payloads.
    /// Returns transaction ids immediately; progress is polled via
    /// [`transaction`](Self::transaction).
    pub async fn write(&self, id_or_alias: &str, data: Vec<WriteData>) -> SdkResult<Vec<String>> {
        let device = self
            .devices
            .resolve(id_or_alias)
            .await
            .ok_or_else(|| SdkError::NotFound(format!("device {}", id_or_alias)))?;
        let accepted = self.scheduler.write(&device, data).await?;
        Ok(accepted.into_iter().map(|t| t.id).collect())
    }

    /// Snapshot of one transaction.
    pub async fn transaction(&self, id: &str) -> SdkResult<Transaction> {
        self.transactions
            .get(id)
            .await
            .ok_or_else(|| SdkError::NotFound(format!("transaction {}", id)))
    }

    /// Ids of all retained transactions.
    pub async fn transactions(&self) -> Vec<String> {
        self.transactions.ids().await
    }

    /// Current snapshot of every registered health check.
    pub async fn health(&self) -> HealthSnapshot {
        self.health.snapshot().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PluginMetadata, PluginSettings};
    use crate::plugin::Plugin;
    use crate::reading::Value;
    use crate::tag::Tag;
    use async_trait::async_trait;
    use std::time::Duration;

    struct EchoHandler;

    #[async_trait]
    impl crate::device::DeviceHandler for EchoHandler {
        fn name(&self) -> &str {
            "echo"
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::new().read().write()
        }

        async fn read(&self, _device: &Device) -> SdkResult<Vec<Reading>> {
            Ok(vec![Reading::new("temperature", 20.0)])
        }

        async fn write(&self, _device: &Device, _data: &WriteData) -> SdkResult<()> {
            Ok(())
        }
    }

    async fn running_plugin() -> (PluginServer, tokio_util::sync::CancellationToken, tokio::task::JoinHandle<SdkResult<()>>) {
        let mut settings = PluginSettings::default();
        settings.read.interval_ms = 20;
        settings.shutdown.grace_period_ms = 500;

        let plugin = Plugin::builder(PluginMetadata::new("server-test", "neoplug"), settings)
            .register_handler(Arc::new(EchoHandler))
            .register_device(
                Device::new("temperature", "echo")
                    .with_data("address", serde_json::json!(1))
                    .with_alias("probe")
                    .with_tag(Tag::parse("site/zone:a").unwrap()),
            )
            .build()
            .await
            .unwrap();

        let server = plugin.server();
        let token = plugin.shutdown_token();
        let runner = tokio::spawn(plugin.run_with(crate::cli::Options {
            debug: false,
            version: false,
            dry_run: false,
        }));
        // Let the catalog materialize and the first read iteration land.
        tokio::time::sleep(Duration::from_millis(150)).await;
        (server, token, runner)
    }

    async fn shutdown(
        token: tokio_util::sync::CancellationToken,
        runner: tokio::task::JoinHandle<SdkResult<()>>,
    ) {
        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .expect("run did not terminate")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_metadata_and_version_block() {
        let (server, token, runner) = running_plugin().await;

        let metadata = server.metadata();
        assert_eq!(metadata.tag, "neoplug/server-test");
        assert_eq!(metadata.version.sdk_version, crate::VERSION);
        assert!(server.version_block().contains("neoplug/server-test"));

        shutdown(token, runner).await;
    }

    #[tokio::test]
    async fn test_devices_query_with_selector() {
        let (server, token, runner) = running_plugin().await;

        let all = server.devices(&DeviceSelector::all()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].device_type, "temperature");
        assert!(all[0].capabilities.read);

        let by_tag = server
            .devices(&DeviceSelector::by_tags([Tag::parse("site/zone:a").unwrap()]))
            .await
            .unwrap();
        assert_eq!(by_tag.len(), 1);

        let err = server
            .devices(&DeviceSelector::by_id("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, SdkError::NotFound(_)));

        shutdown(token, runner).await;
    }

    #[tokio::test]
    async fn test_read_returns_latest_cached() {
        let (server, token, runner) = running_plugin().await;

        let readings = server.read(&DeviceSelector::all()).await.unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].output, "temperature");
        assert_eq!(readings[0].value, Value::Float(20.0));

        shutdown(token, runner).await;
    }

    #[tokio::test]
    async fn test_read_stream_receives_until_cancel() {
        let (server, token, runner) = running_plugin().await;

        let mut stream = server
            .read_stream(&DeviceSelector::by_id("probe"))
            .await
            .unwrap();
        let reading = tokio::time::timeout(Duration::from_secs(1), stream.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reading.output, "temperature");

        shutdown(token, runner).await;
        // Channel closes once the plugin stops.
        tokio::time::timeout(Duration::from_secs(1), async {
            while stream.recv().await.is_some() {}
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_write_by_alias_and_transaction_poll() {
        let (server, token, runner) = running_plugin().await;

        let ids = server
            .write("probe", vec![WriteData::new("state")])
            .await
            .unwrap();
        assert_eq!(ids.len(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let txn = server.transaction(&ids[0]).await.unwrap();
        assert_eq!(txn.status, crate::transaction::Status::Done);

        let err = server.transaction("missing").await.unwrap_err();
        assert!(matches!(err, SdkError::NotFound(_)));

        shutdown(token, runner).await;
    }

    #[tokio::test]
    async fn test_health_snapshot_has_builtin_checks() {
        let (server, token, runner) = running_plugin().await;

        let snapshot = server.health().await;
        let names: Vec<&str> = snapshot.checks.iter().map(|c| c.name.as_str()).collect();
        assert!(names.contains(&"read channel"));
        assert!(names.contains(&"write queue"));
        assert!(names.contains(&"listeners"));

        shutdown(token, runner).await;
    }
}
