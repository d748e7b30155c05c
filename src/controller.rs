//! Wires configuration into a running updates core.

use crate::code_signing::CodeSigningVerifier;
use crate::config::{CheckOnLaunch, UpdatesConfig};
use crate::download::AssetDownloader;
use crate::error::{Error, Result};
use crate::event::{create_event_channel, UpdatesEventsChannel, UpdatesEventsSender};
use crate::kv::{FileKeyValueStore, KeyValueStore};
use crate::launcher::{LaunchSpec, LauncherHost, UpdatesLauncher};
use crate::manifest::Manifest;
use crate::remote::{AssetSource, HttpRemote, ManifestSource};
use crate::selection::{
    NewestUpdatePolicy, RollbackSelectionPolicy, RuntimeCompatibility, SelectionPolicy,
    StagedRolloutPolicy,
};
use crate::statemachine::{CheckResult, StateMachineParts, UpdatesStateMachine};
use crate::store::UpdateStore;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Builder for the updates core.
pub struct UpdatesBuilder {
    config: UpdatesConfig,
    host: Arc<dyn LauncherHost>,
    kv: Option<Arc<dyn KeyValueStore>>,
    manifests: Option<Arc<dyn ManifestSource>>,
    assets: Option<Arc<dyn AssetSource>>,
    policy: Option<Arc<dyn SelectionPolicy>>,
    compatibility: Option<Arc<dyn RuntimeCompatibility>>,
}

impl UpdatesBuilder {
    /// Create a builder for a host.
    #[must_use]
    pub fn new(config: UpdatesConfig, host: Arc<dyn LauncherHost>) -> Self {
        Self {
            config,
            host,
            kv: None,
            manifests: None,
            assets: None,
            policy: None,
            compatibility: None,
        }
    }

    /// Use host-provided storage instead of files under `root_dir`.
    #[must_use]
    pub fn with_kv(mut self, kv: Arc<dyn KeyValueStore>) -> Self {
        self.kv = Some(kv);
        self
    }

    /// Use a custom manifest source instead of HTTP.
    #[must_use]
    pub fn with_manifest_source(mut self, source: Arc<dyn ManifestSource>) -> Self {
        self.manifests = Some(source);
        self
    }

    /// Use a custom asset source instead of HTTP.
    #[must_use]
    pub fn with_asset_source(mut self, source: Arc<dyn AssetSource>) -> Self {
        self.assets = Some(source);
        self
    }

    /// Replace the selection policy.
    #[must_use]
    pub fn with_policy(mut self, policy: Arc<dyn SelectionPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Compare runtime versions with host rules.
    #[must_use]
    pub fn with_runtime_compatibility(mut self, compatibility: Arc<dyn RuntimeCompatibility>) -> Self {
        self.compatibility = Some(compatibility);
        self
    }

    /// Assemble the core.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is incomplete, the signing key
    /// cannot be loaded or storage cannot be opened.
    pub fn build(self) -> Result<RunningUpdates> {
        let config = self.config;
        info!("Building expo-updates with config: {config:?}");

        std::fs::create_dir_all(&config.root_dir)?;
        let scope_key = config.effective_scope_key()?;

        let kv: Arc<dyn KeyValueStore> = match self.kv {
            Some(kv) => kv,
            None => Arc::new(FileKeyValueStore::open(config.state_dir())?),
        };
        let store = UpdateStore::open(config.asset_dir(), Arc::clone(&kv))?;
        let verifier = CodeSigningVerifier::new(config.signing_config()?);

        let (manifests, assets) = match (self.manifests, self.assets) {
            (Some(manifests), Some(assets)) => (manifests, assets),
            (manifests, assets) => {
                let http = Arc::new(HttpRemote::new(config.http_remote_config()?)?);
                let manifests: Arc<dyn ManifestSource> = match manifests {
                    Some(manifests) => manifests,
                    None => http.clone(),
                };
                let assets: Arc<dyn AssetSource> = match assets {
                    Some(assets) => assets,
                    None => http,
                };
                (manifests, assets)
            }
        };

        let policy = match self.policy {
            Some(policy) => policy,
            None => default_policy(&config, self.compatibility),
        };

        let (events_tx, events_rx) = create_event_channel();
        let embedded = match self.host.embedded_manifest() {
            Some(manifest) => Some(manifest),
            None => load_embedded_manifest(&config)?,
        };

        let machine = UpdatesStateMachine::new(StateMachineParts {
            scope_key,
            runtime_version: config.runtime_version.clone(),
            store,
            verifier,
            manifests,
            downloader: AssetDownloader::new(assets, config.max_concurrent_downloads),
            policy,
            host: self.host,
            kv,
            events: events_tx.clone(),
        })?;

        let launcher = UpdatesLauncher::new(machine);
        launcher.register_embedded(embedded);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(RunningUpdates {
            config,
            launcher,
            shutdown_tx,
            shutdown_rx,
            events_tx,
            events_rx: Some(events_rx),
        })
    }
}

/// Rollback-aware newest-first selection, gated by staged rollout when a
/// device id is configured.
fn default_policy(
    config: &UpdatesConfig,
    compatibility: Option<Arc<dyn RuntimeCompatibility>>,
) -> Arc<dyn SelectionPolicy> {
    let newest = match compatibility {
        Some(compatibility) => NewestUpdatePolicy::with_compatibility(compatibility),
        None => NewestUpdatePolicy::new(),
    };
    let base: Arc<dyn SelectionPolicy> = Arc::new(RollbackSelectionPolicy::new(newest));
    match &config.rollout.device_id {
        Some(device_id) => Arc::new(StagedRolloutPolicy::new(base, device_id.as_bytes())),
        None => base,
    }
}

fn load_embedded_manifest(config: &UpdatesConfig) -> Result<Option<Manifest>> {
    let Some(path) = &config.embedded_manifest else {
        return Ok(None);
    };
    let raw = std::fs::read(path).map_err(|e| {
        Error::Config(format!(
            "failed to read embedded manifest '{}': {e}",
            path.display()
        ))
    })?;
    Manifest::parse(&raw).map(Some)
}

/// A running updates core.
pub struct RunningUpdates {
    config: UpdatesConfig,
    launcher: UpdatesLauncher,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    events_tx: UpdatesEventsSender,
    events_rx: Option<UpdatesEventsChannel>,
}

impl RunningUpdates {
    /// Configuration in effect.
    #[must_use]
    pub fn config(&self) -> &UpdatesConfig {
        &self.config
    }

    /// Launcher and app-facing module.
    #[must_use]
    pub fn launcher(&self) -> &UpdatesLauncher {
        &self.launcher
    }

    /// State machine.
    #[must_use]
    pub fn state_machine(&self) -> &UpdatesStateMachine {
        self.launcher.state_machine()
    }

    /// Get a receiver for events.
    ///
    /// Note: Can only be called once. Subsequent calls return None.
    pub fn events(&mut self) -> Option<UpdatesEventsChannel> {
        self.events_rx.take()
    }

    /// Subscribe to events.
    #[must_use]
    pub fn subscribe_events(&self) -> UpdatesEventsChannel {
        self.events_tx.subscribe()
    }

    /// Pick and hold the update to run, then prune what is no longer
    /// needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if nothing is launchable.
    pub fn launch(&self) -> Result<LaunchSpec> {
        let spec = self.launcher.select_launch()?;
        match self.launcher.garbage_collect(&self.config.retention_policy()) {
            Ok(report) => debug!(
                "Post-launch cleanup removed {} updates",
                report.removed_updates.len()
            ),
            Err(e) => warn!("Post-launch cleanup failed: {e}"),
        }
        Ok(spec)
    }

    fn should_check_on_launch(&self) -> bool {
        match self.config.check_on_launch {
            CheckOnLaunch::Always => true,
            CheckOnLaunch::Never => false,
            CheckOnLaunch::ErrorRecoveryOnly => {
                let machine = self.state_machine();
                let scope = machine.criteria().scope_key;
                machine
                    .store()
                    .list_candidates(&scope)
                    .iter()
                    .any(crate::store::Update::is_flagged_bad)
            }
        }
    }

    /// Run background checks until shutdown is requested.
    ///
    /// Checks once at launch (per `check_on_launch`), then every
    /// `check_interval_secs` if set. An available update is downloaded
    /// and left pending for the next launch or relaunch.
    ///
    /// # Errors
    ///
    /// Returns an error if the core encounters a fatal error.
    pub async fn run(&mut self) -> Result<()> {
        info!("Starting expo-updates");

        let machine = self.state_machine().clone();
        let interval = self.config.check_interval();
        let check_now = self.should_check_on_launch();
        let mut shutdown_rx = self.shutdown_rx.clone();
        let checker = tokio::spawn(async move {
            if check_now {
                check_and_fetch(&machine).await;
            }
            let Some(interval) = interval else {
                return;
            };
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            machine.cancel();
                            break;
                        }
                    }
                    () = tokio::time::sleep(interval) => {
                        check_and_fetch(&machine).await;
                    }
                }
            }
            debug!("Update checks stopped");
        });

        info!("Updates running, waiting for shutdown signal");

        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("Shutdown signal received");
                        break;
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Ctrl-C received, initiating shutdown");
                    self.shutdown();
                    break;
                }
            }
        }

        self.state_machine().cancel();
        checker.abort();
        info!("Updates shutdown complete");
        Ok(())
    }

    /// Request shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn check_and_fetch(machine: &UpdatesStateMachine) {
    match machine.check().await {
        Ok(CheckResult::NoUpdateAvailable) => debug!("No update available"),
        Ok(_) => {
            if let Err(e) = machine.fetch().await {
                warn!("Background fetch failed: {e}");
            }
        }
        Err(e) => debug!("Background check failed: {e}"),
    }
}
