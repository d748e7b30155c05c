//! Launcher binding: the boundary between the updates core, the host
//! platform and the app.
//!
//! - [`LauncherHost`] is implemented by the host. It swaps the active
//!   bundle and relaunches, and supplies the build-time manifest.
//! - [`UpdatesModule`] is the typed method table the app calls.
//! - [`UpdatesLauncher`] implements [`UpdatesModule`] on top of the state
//!   machine and picks the update to run at cold start.

use crate::error::{Error, Result};
use crate::event::{add_listener, Subscription, UpdatesEvent};
use crate::manifest::Manifest;
use crate::statemachine::{CheckResult, LauncherContext, UpdatesStateMachine};
use crate::store::{AssetLease, GcReport, RetentionPolicy, Update};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{info, warn};
use uuid::Uuid;

/// Everything the host needs to run an update.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// The update to run.
    pub update: Update,
    /// Path of the launch asset; `None` for the embedded update, whose
    /// bundle ships inside the binary.
    pub launch_asset: Option<PathBuf>,
    /// Asset paths by manifest key.
    pub assets: BTreeMap<String, PathBuf>,
}

impl LaunchSpec {
    /// Describe a leased update.
    #[must_use]
    pub fn from_lease(lease: &AssetLease) -> Self {
        Self {
            update: lease.update().clone(),
            launch_asset: lease.launch_asset_path().map(PathBuf::from),
            assets: lease.paths().clone(),
        }
    }

    /// Whether this launches the embedded update.
    #[must_use]
    pub fn is_embedded(&self) -> bool {
        self.update.is_embedded
    }
}

/// Host platform primitives.
#[async_trait]
pub trait LauncherHost: Send + Sync {
    /// Swap the active bundle to `spec` and relaunch the app.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Host`] if the relaunch did not happen.
    async fn relaunch(&self, spec: &LaunchSpec) -> Result<()>;

    /// The manifest built into the binary, if any.
    fn embedded_manifest(&self) -> Option<Manifest> {
        None
    }
}

/// Result of `checkForUpdateAsync`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCheckResult {
    /// Whether there is something to fetch.
    pub is_available: bool,
    /// Whether that something is a return to the embedded update.
    pub is_rollback_to_embedded: bool,
    /// Manifest of the available update.
    pub manifest: Option<Manifest>,
    /// Commit time of a roll-back directive.
    pub rollback_commit_time: Option<DateTime<Utc>>,
}

/// Result of `fetchUpdateAsync`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateFetchResult {
    /// Whether a new update is now pending.
    pub is_new: bool,
    /// Whether the pending update is the embedded one.
    pub is_rollback_to_embedded: bool,
    /// Manifest of the pending update.
    pub manifest: Option<Manifest>,
}

/// App-facing API.
#[async_trait]
pub trait UpdatesModule: Send + Sync {
    /// Ask the server for a newer update.
    ///
    /// # Errors
    ///
    /// See [`UpdatesStateMachine::check`].
    async fn check_for_update_async(&self) -> Result<UpdateCheckResult>;

    /// Download the update found by the last check.
    ///
    /// # Errors
    ///
    /// See [`UpdatesStateMachine::fetch`].
    async fn fetch_update_async(&self) -> Result<UpdateFetchResult>;

    /// Relaunch on the best available update.
    ///
    /// # Errors
    ///
    /// See [`UpdatesStateMachine::reload`].
    async fn reload(&self) -> Result<()>;

    /// Snapshot of the state machine context.
    async fn get_native_state_machine_context_async(&self) -> LauncherContext;

    /// Call `callback` with every event until the subscription drops.
    fn add_listener(&self, callback: Box<dyn Fn(UpdatesEvent) + Send + 'static>) -> Subscription;
}

/// Launch selection plus the app-facing module.
#[derive(Debug, Clone)]
pub struct UpdatesLauncher {
    machine: UpdatesStateMachine,
}

impl UpdatesLauncher {
    /// Bind a state machine.
    #[must_use]
    pub fn new(machine: UpdatesStateMachine) -> Self {
        Self { machine }
    }

    /// Underlying state machine.
    #[must_use]
    pub fn state_machine(&self) -> &UpdatesStateMachine {
        &self.machine
    }

    /// Register the host's embedded manifest with the store.
    pub fn register_embedded(&self, manifest: Option<Manifest>) {
        if let Some(manifest) = manifest {
            let scope = self.machine.criteria().scope_key;
            self.machine.store().set_embedded(Update::embedded(manifest, scope));
        }
    }

    /// Pick the update to run at cold start and hold its assets.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if no update (not even the embedded
    /// one) is launchable.
    pub fn select_launch(&self) -> Result<LaunchSpec> {
        let criteria = self.machine.criteria();
        let store = self.machine.store();
        let candidates = store.list_candidates(&criteria.scope_key);

        let mut choice = self.machine.policy().launchable_update(&candidates, &criteria);
        let lease = loop {
            let Some(update) = choice.take() else {
                return Err(Error::NotFound(format!(
                    "no launchable update among {} candidates",
                    candidates.len()
                )));
            };
            match store.resolve_assets(update.id) {
                Ok(lease) => break lease,
                Err(e) => {
                    // Assets vanished underneath us; fall back to embedded.
                    warn!("Cannot launch update {}: {e}", update.id);
                    choice = store.embedded().filter(|embedded| embedded.id != update.id);
                }
            }
        };

        let spec = LaunchSpec::from_lease(&lease);
        if let Err(e) = store.mark_launched(spec.update.id) {
            warn!("Failed to record launch of {}: {e}", spec.update.id);
        }
        info!(
            "Launching update {}{}",
            spec.update.id,
            if spec.is_embedded() { " (embedded)" } else { "" }
        );
        self.machine.note_launched(lease);
        Ok(spec)
    }

    /// The running update reached a working state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if nothing was launched, or a storage
    /// error.
    pub fn mark_launch_succeeded(&self) -> Result<()> {
        let id = self.running_id()?;
        self.machine.store().mark_launch_succeeded(id).map(|_| ())
    }

    /// The running update crashed before reaching a working state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if nothing was launched, or a storage
    /// error.
    pub fn mark_launch_failed(&self) -> Result<()> {
        let id = self.running_id()?;
        self.machine.store().mark_launch_failed(id).map(|_| ())
    }

    /// Remove updates and assets no longer needed.
    ///
    /// # Errors
    ///
    /// See [`crate::store::UpdateStore::garbage_collect`].
    pub fn garbage_collect(&self, retention: &RetentionPolicy) -> Result<GcReport> {
        self.machine.store().garbage_collect(retention)
    }

    fn running_id(&self) -> Result<Uuid> {
        self.machine
            .running_update_id()
            .ok_or_else(|| Error::NotFound("no update has been launched".to_string()))
    }
}

#[async_trait]
impl UpdatesModule for UpdatesLauncher {
    async fn check_for_update_async(&self) -> Result<UpdateCheckResult> {
        let result = match self.machine.check().await? {
            CheckResult::UpdateAvailable(manifest) => UpdateCheckResult {
                is_available: true,
                is_rollback_to_embedded: false,
                manifest: Some(*manifest),
                rollback_commit_time: None,
            },
            CheckResult::RollBackToEmbedded { commit_time } => UpdateCheckResult {
                is_available: true,
                is_rollback_to_embedded: true,
                manifest: None,
                rollback_commit_time: Some(commit_time),
            },
            CheckResult::NoUpdateAvailable => UpdateCheckResult {
                is_available: false,
                is_rollback_to_embedded: false,
                manifest: None,
                rollback_commit_time: None,
            },
        };
        Ok(result)
    }

    async fn fetch_update_async(&self) -> Result<UpdateFetchResult> {
        let fetched = self.machine.fetch().await?;
        Ok(UpdateFetchResult {
            is_new: true,
            is_rollback_to_embedded: fetched.is_rollback,
            manifest: Some(fetched.update.manifest),
        })
    }

    async fn reload(&self) -> Result<()> {
        self.machine.reload().await.map(|_| ())
    }

    async fn get_native_state_machine_context_async(&self) -> LauncherContext {
        self.machine.context()
    }

    fn add_listener(&self, callback: Box<dyn Fn(UpdatesEvent) + Send + 'static>) -> Subscription {
        add_listener(self.machine.events(), callback)
    }
}
