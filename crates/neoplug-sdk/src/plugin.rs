//! Plugin assembly and lifecycle.
//!
//! A plugin is assembled through [`PluginBuilder`]: handlers, devices,
//! lifecycle actions, and hooks are collected up front, then [`build`]
//! resolves the plugin identity and wires the components together.
//! [`Plugin::run`] drives the fixed phase order: materialize devices,
//! initialize the scheduler, run pre-run and device-setup actions, start the
//! workers, block until termination, then unwind.
//!
//! [`build`]: PluginBuilder::build

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cache::ReadingCache;
use crate::cli::Options;
use crate::config::{ConfigPolicy, DeviceConfig, PluginMetadata, PluginSettings};
use crate::device::{Device, DeviceHandler};
use crate::error::{MultiError, SdkError, SdkResult};
use crate::health::{HealthCheck, HealthRegistry, ListenerHealthCheck, QueueUtilizationCheck};
use crate::identity::PluginId;
use crate::manager::{DeviceHooks, DeviceManager, DeviceSetupAction};
use crate::scheduler::DataManager;
use crate::server::PluginServer;
use crate::transaction::TransactionStore;

/// A plugin-level action run before the workers start or after they stop.
#[async_trait]
pub trait PluginAction: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self) -> SdkResult<()>;
}

/// Collects everything a plugin is made of before the components are wired.
pub struct PluginBuilder {
    metadata: PluginMetadata,
    settings: PluginSettings,
    handlers: Vec<Arc<dyn DeviceHandler>>,
    devices: Vec<Device>,
    device_configs: Vec<DeviceConfig>,
    hooks: DeviceHooks,
    pre_run: Vec<Arc<dyn PluginAction>>,
    post_run: Vec<Arc<dyn PluginAction>>,
    setup_actions: Vec<Arc<dyn DeviceSetupAction>>,
    health_checks: Vec<(Arc<dyn HealthCheck>, Option<Duration>)>,
}

impl PluginBuilder {
    fn new(metadata: PluginMetadata, settings: PluginSettings) -> Self {
        Self {
            metadata,
            settings,
            handlers: Vec::new(),
            devices: Vec::new(),
            device_configs: Vec::new(),
            hooks: DeviceHooks::default(),
            pre_run: Vec::new(),
            post_run: Vec::new(),
            setup_actions: Vec::new(),
            health_checks: Vec::new(),
        }
    }

    /// Register a device handler.
    pub fn register_handler(mut self, handler: Arc<dyn DeviceHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Register a device built in code.
    pub fn register_device(mut self, device: Device) -> Self {
        self.devices.push(device);
        self
    }

    /// Register devices from parsed static configuration.
    pub fn register_device_configs(mut self, configs: Vec<DeviceConfig>) -> Self {
        self.device_configs.extend(configs);
        self
    }

    /// Override the device-identifier hook.
    pub fn with_device_identifier(mut self, hook: crate::manager::DeviceIdentifier) -> Self {
        self.hooks.identifier = Some(hook);
        self
    }

    /// Install a device-data validator.
    pub fn with_device_validator(mut self, hook: crate::manager::DeviceValidator) -> Self {
        self.hooks.validator = Some(hook);
        self
    }

    /// Install the dynamic registration hook yielding device configs.
    pub fn with_dynamic_config_registrar(
        mut self,
        hook: crate::manager::DynamicConfigRegistrar,
    ) -> Self {
        self.hooks.dynamic_config = Some(hook);
        self
    }

    /// Install the dynamic registration hook yielding devices.
    pub fn with_dynamic_device_registrar(
        mut self,
        hook: crate::manager::DynamicDeviceRegistrar,
    ) -> Self {
        self.hooks.dynamic_devices = Some(hook);
        self
    }

    /// Queue an action for the pre-run phase. Actions run in registration
    /// order.
    pub fn register_pre_run_action(mut self, action: Arc<dyn PluginAction>) -> Self {
        self.pre_run.push(action);
        self
    }

    /// Queue an action for the post-run phase. Actions run in registration
    /// order.
    pub fn register_post_run_action(mut self, action: Arc<dyn PluginAction>) -> Self {
        self.post_run.push(action);
        self
    }

    /// Queue device-setup actions; each must carry a non-empty filter.
    pub fn register_device_setup_action(mut self, action: Arc<dyn DeviceSetupAction>) -> Self {
        self.setup_actions.push(action);
        self
    }

    /// Register a custom health check; `interval` defaults to the configured
    /// health cadence.
    pub fn register_health_check(
        mut self,
        check: Arc<dyn HealthCheck>,
        interval: Option<Duration>,
    ) -> Self {
        self.health_checks.push((check, interval));
        self
    }

    /// Resolve the plugin identity and wire the components together.
    ///
    /// Handler registration happens here, so duplicate handler names surface
    /// before the plugin runs. Devices materialize during [`Plugin::run`].
    pub async fn build(self) -> SdkResult<Plugin> {
        let id = PluginId::new(&self.settings.id, &self.metadata)?;

        let manager = Arc::new(DeviceManager::new(
            id.clone(),
            self.settings.write.timeout(),
            self.hooks,
        ));
        for handler in self.handlers {
            manager.add_handler(handler).await?;
        }
        manager.add_device_setup_actions(self.setup_actions).await?;

        let transactions = Arc::new(TransactionStore::new(
            self.settings.transaction.capacity,
            self.settings.transaction.ttl(),
        ));
        let cache = Arc::new(ReadingCache::new(self.settings.read.cache_size));
        let token = CancellationToken::new();
        let scheduler = Arc::new(DataManager::new(
            self.settings.clone(),
            Arc::clone(&manager),
            Arc::clone(&transactions),
            Arc::clone(&cache),
            token.child_token(),
        ));

        let health = Arc::new(HealthRegistry::new());
        let interval = self.settings.health.interval();
        if self.settings.health.checks_enabled {
            health
                .register(
                    Arc::new(QueueUtilizationCheck::new(
                        "read channel",
                        scheduler.read_channel(),
                    )),
                    interval,
                )
                .await;
            health
                .register(
                    Arc::new(QueueUtilizationCheck::new(
                        "write queue",
                        scheduler.write_channel(),
                    )),
                    interval,
                )
                .await;
            health
                .register(
                    Arc::new(ListenerHealthCheck::new(
                        scheduler.listener_stats(),
                        self.settings.listen.max_restarts,
                    )),
                    interval,
                )
                .await;
        }
        for (check, cadence) in self.health_checks {
            health.register(check, cadence.unwrap_or(interval)).await;
        }

        Ok(Plugin {
            metadata: self.metadata,
            settings: self.settings,
            id,
            manager,
            transactions,
            cache,
            scheduler,
            health,
            token,
            devices: self.devices,
            device_configs: self.device_configs,
            pre_run: self.pre_run,
            post_run: self.post_run,
        })
    }
}

/// A device plugin: the components the SDK owns, wired and ready to run.
pub struct Plugin {
    metadata: PluginMetadata,
    settings: PluginSettings,
    id: PluginId,
    manager: Arc<DeviceManager>,
    transactions: Arc<TransactionStore>,
    cache: Arc<ReadingCache>,
    scheduler: Arc<DataManager>,
    health: Arc<HealthRegistry>,
    token: CancellationToken,
    devices: Vec<Device>,
    device_configs: Vec<DeviceConfig>,
    pre_run: Vec<Arc<dyn PluginAction>>,
    post_run: Vec<Arc<dyn PluginAction>>,
}

impl Plugin {
    /// Start assembling a plugin.
    pub fn builder(metadata: PluginMetadata, settings: PluginSettings) -> PluginBuilder {
        PluginBuilder::new(metadata, settings)
    }

    /// The plugin's deterministic identity.
    pub fn id(&self) -> &PluginId {
        &self.id
    }

    /// The device catalog.
    pub fn devices(&self) -> &Arc<DeviceManager> {
        &self.manager
    }

    /// Handle used to request shutdown from outside the run loop.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// The RPC surface over this plugin; hand it to the transport binding.
    pub fn server(&self) -> PluginServer {
        PluginServer::new(
            self.metadata.clone(),
            self.id.clone(),
            Arc::clone(&self.manager),
            Arc::clone(&self.scheduler),
            Arc::clone(&self.transactions),
            Arc::clone(&self.cache),
            Arc::clone(&self.health),
        )
    }

    /// Parse command-line flags and run the plugin to completion.
    pub async fn run(self) -> SdkResult<()> {
        let options = Options::from_args();
        self.run_with(options).await
    }

    /// Run the plugin with pre-parsed flags.
    pub async fn run_with(mut self, options: Options) -> SdkResult<()> {
        if options.version {
            println!("{}", self.server().version_block());
            return Ok(());
        }
        crate::cli::init_tracing(options.debug);

        info!(
            plugin = %self.metadata.tag(),
            id = %self.id,
            "starting plugin"
        );

        // Materialize the catalog, then validate the scheduler against it.
        self.register_devices().await?;
        self.scheduler.init().await?;

        self.run_pre_run_actions().await?;
        self.run_setup_actions().await?;

        if options.dry_run {
            info!("dry run complete");
            return Ok(());
        }

        self.scheduler.start().await?;
        let health_runners = self.health.start(self.token.child_token()).await;
        info!(checks = self.health.check_count().await, "health runners started");
        info!("rpc surface ready");

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!(error = %e, "failed to listen for termination signal");
                }
                info!("termination signal received");
            }
            _ = self.token.cancelled() => {
                info!("shutdown requested");
            }
        }

        self.scheduler.stop().await?;
        for runner in health_runners {
            runner.abort();
        }

        for action in &self.post_run {
            if let Err(e) = action.run().await {
                warn!(action = action.name(), error = %e, "post-run action failed");
            }
        }

        info!("plugin terminated");
        Ok(())
    }

    /// Phase 3: materialize devices from code, static config, and dynamic
    /// registration. Any failure here aborts startup.
    async fn register_devices(&mut self) -> SdkResult<()> {
        let static_configured =
            !self.devices.is_empty() || !self.device_configs.is_empty();

        match self.settings.policies.device_config {
            ConfigPolicy::Required if !static_configured => {
                return Err(SdkError::Config(
                    "device config is required but none was provided".into(),
                ));
            }
            ConfigPolicy::Prohibited if static_configured => {
                return Err(SdkError::Config(
                    "device config is prohibited but was provided".into(),
                ));
            }
            _ => {}
        }

        for device in std::mem::take(&mut self.devices) {
            self.manager.add_device(device).await?;
        }

        Ok(())
    }

    /// Phase 5: pre-run actions in registration order; failures collect and
    /// are judged against the startup-actions policy.
    async fn run_pre_run_actions(&self) -> SdkResult<()> {
        let mut failures = MultiError::new();
        for action in &self.pre_run {
            info!(action = action.name(), "running pre-run action");
            if let Err(e) = action.run().await {
                warn!(action = action.name(), error = %e, "pre-run action failed");
                failures.push(e);
            }
        }
        self.judge_action_failures("pre-run", failures)
    }

    /// Phase 6: device-setup actions; per-device failures collect and are
    /// judged against the startup-actions policy.
    async fn run_setup_actions(&self) -> SdkResult<()> {
        match self.manager.start().await {
            Ok(()) => Ok(()),
            Err(failures) => self.judge_action_failures("device-setup", failures),
        }
    }

    fn judge_action_failures(&self, phase: &str, failures: MultiError) -> SdkResult<()> {
        if failures.is_empty() {
            return Ok(());
        }
        if self.settings.policies.startup_actions == ConfigPolicy::Required {
            return Err(SdkError::Config(format!(
                "{} actions failed under required policy: {}",
                phase, failures
            )));
        }
        warn!(phase, error = %failures, "startup actions failed; continuing per policy");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IdentitySettings;
    use crate::device::Capabilities;
    use crate::reading::Reading;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ReadOnlyHandler;

    #[async_trait]
    impl DeviceHandler for ReadOnlyHandler {
        fn name(&self) -> &str {
            "readonly"
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::new().read()
        }

        async fn read(&self, _device: &Device) -> SdkResult<Vec<Reading>> {
            Ok(vec![Reading::new("temperature", 20.0)])
        }
    }

    struct CountingAction {
        name: &'static str,
        runs: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl PluginAction for CountingAction {
        fn name(&self) -> &str {
            self.name
        }

        async fn run(&self) -> SdkResult<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(SdkError::Transient("action failed".into()))
            } else {
                Ok(())
            }
        }
    }

    fn metadata() -> PluginMetadata {
        PluginMetadata::new("test-plugin", "neoplug")
    }

    fn fast_settings() -> PluginSettings {
        let mut settings = PluginSettings::default();
        settings.read.interval_ms = 20;
        settings.shutdown.grace_period_ms = 500;
        settings
    }

    #[tokio::test]
    async fn test_build_resolves_identity() {
        let plugin = Plugin::builder(metadata(), fast_settings())
            .register_handler(Arc::new(ReadOnlyHandler))
            .build()
            .await
            .unwrap();
        assert_eq!(plugin.id().name(), "neoplug/test-plugin");
    }

    #[tokio::test]
    async fn test_build_fails_without_identity_ingredients() {
        let mut settings = fast_settings();
        settings.id = IdentitySettings {
            use_plugin_tag: false,
            use_machine_id: false,
            use_env: Vec::new(),
            use_custom: Vec::new(),
        };
        let err = Plugin::builder(metadata(), settings).build().await.unwrap_err();
        assert!(matches!(err, SdkError::Config(_)));
    }

    #[tokio::test]
    async fn test_duplicate_handler_fails_build() {
        let err = Plugin::builder(metadata(), fast_settings())
            .register_handler(Arc::new(ReadOnlyHandler))
            .register_handler(Arc::new(ReadOnlyHandler))
            .build()
            .await
            .unwrap_err();
        assert!(matches!(err, SdkError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_dry_run_runs_actions_and_exits() {
        let pre_runs = Arc::new(AtomicUsize::new(0));
        let post_runs = Arc::new(AtomicUsize::new(0));

        let plugin = Plugin::builder(metadata(), fast_settings())
            .register_handler(Arc::new(ReadOnlyHandler))
            .register_device(
                Device::new("temperature", "readonly")
                    .with_data("address", serde_json::json!(1)),
            )
            .register_pre_run_action(Arc::new(CountingAction {
                name: "pre",
                runs: Arc::clone(&pre_runs),
                fail: false,
            }))
            .register_post_run_action(Arc::new(CountingAction {
                name: "post",
                runs: Arc::clone(&post_runs),
                fail: false,
            }))
            .build()
            .await
            .unwrap();

        let options = Options {
            debug: false,
            version: false,
            dry_run: true,
        };
        plugin.run_with(options).await.unwrap();

        assert_eq!(pre_runs.load(Ordering::SeqCst), 1);
        // Dry run exits before the workers start; post-run never fires.
        assert_eq!(post_runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_required_policy_aborts_on_action_failure() {
        let mut settings = fast_settings();
        settings.policies.startup_actions = ConfigPolicy::Required;

        let plugin = Plugin::builder(metadata(), settings)
            .register_handler(Arc::new(ReadOnlyHandler))
            .register_pre_run_action(Arc::new(CountingAction {
                name: "pre",
                runs: Arc::new(AtomicUsize::new(0)),
                fail: true,
            }))
            .build()
            .await
            .unwrap();

        let options = Options {
            debug: false,
            version: false,
            dry_run: true,
        };
        let err = plugin.run_with(options).await.unwrap_err();
        assert!(matches!(err, SdkError::Config(_)));
    }

    #[tokio::test]
    async fn test_optional_policy_continues_on_action_failure() {
        let plugin = Plugin::builder(metadata(), fast_settings())
            .register_handler(Arc::new(ReadOnlyHandler))
            .register_pre_run_action(Arc::new(CountingAction {
                name: "pre",
                runs: Arc::new(AtomicUsize::new(0)),
                fail: true,
            }))
            .build()
            .await
            .unwrap();

        let options = Options {
            debug: false,
            version: false,
            dry_run: true,
        };
        plugin.run_with(options).await.unwrap();
    }

    #[tokio::test]
    async fn test_device_config_policies() {
        let mut settings = fast_settings();
        settings.policies.device_config = ConfigPolicy::Required;
        let plugin = Plugin::builder(metadata(), settings)
            .register_handler(Arc::new(ReadOnlyHandler))
            .build()
            .await
            .unwrap();
        let err = plugin
            .run_with(Options {
                debug: false,
                version: false,
                dry_run: true,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SdkError::Config(_)));

        let mut settings = fast_settings();
        settings.policies.device_config = ConfigPolicy::Prohibited;
        let plugin = Plugin::builder(metadata(), settings)
            .register_handler(Arc::new(ReadOnlyHandler))
            .register_device(
                Device::new("temperature", "readonly")
                    .with_data("address", serde_json::json!(1)),
            )
            .build()
            .await
            .unwrap();
        let err = plugin
            .run_with(Options {
                debug: false,
                version: false,
                dry_run: true,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SdkError::Config(_)));
    }

    #[tokio::test]
    async fn test_full_lifecycle_with_shutdown_token() {
        let post_runs = Arc::new(AtomicUsize::new(0));
        let plugin = Plugin::builder(metadata(), fast_settings())
            .register_handler(Arc::new(ReadOnlyHandler))
            .register_device(
                Device::new("temperature", "readonly")
                    .with_data("address", serde_json::json!(1)),
            )
            .register_post_run_action(Arc::new(CountingAction {
                name: "post",
                runs: Arc::clone(&post_runs),
                fail: false,
            }))
            .build()
            .await
            .unwrap();

        let token = plugin.shutdown_token();
        let server = plugin.server();
        let runner = tokio::spawn(plugin.run_with(Options {
            debug: false,
            version: false,
            dry_run: false,
        }));

        // Give the read loop a few iterations, then ask for shutdown.
        tokio::time::sleep(Duration::from_millis(150)).await;
        let readings = server
            .read(&crate::manager::DeviceSelector::all())
            .await
            .unwrap();
        assert!(!readings.is_empty());

        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .expect("run did not terminate")
            .unwrap()
            .unwrap();
        assert_eq!(post_runs.load(Ordering::SeqCst), 1);
    }
}

#[allow(dead_code)]
fn _assert_send_plugin_is_send(p: Plugin) {
    fn is_send<T: Send>(_: T) {}
    is_send(p);
}

fn _assert_send_register_devices(mut p: Plugin) {
    fn is_send<T: Send>(_: T) {}
    is_send(p.register_devices());
}
