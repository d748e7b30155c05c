//! Update state machine.
//!
//! ```text
//! Idle ──check──▶ Checking ──▶ NoUpdateAvailable ──▶ Idle
//!                          └─▶ UpdateAvailable ──fetch──▶ Downloading ──▶ DownloadFailed ──▶ Idle
//!                                                                    └─▶ Ready ──restart──▶ Restarting ──▶ Idle
//! ```
//!
//! One transition is in flight at a time. The state and [`LauncherContext`]
//! live in a single register behind a mutex; an operation claims the
//! register by moving it to an in-flight state, and concurrent calls are
//! rejected with [`Error::InvalidStateTransition`] instead of queueing.
//! The mutex is never held across network I/O. A claim that is dropped
//! before its operation settles, e.g. by a timeout around the future,
//! restores the state it was claimed from.
//!
//! `NoUpdateAvailable` and `DownloadFailed` are transient: they are
//! published and immediately followed by the resting state (`Idle`, or
//! `Ready` while a downloaded update is still pending). The context is
//! persisted after every transition.

mod context;

pub use context::{ContextError, LauncherContext};

use crate::code_signing::CodeSigningVerifier;
use crate::download::AssetDownloader;
use crate::error::{Error, Result};
use crate::event::{UpdatesEvent, UpdatesEventsChannel, UpdatesEventsSender};
use crate::kv::KeyValueStore;
use crate::launcher::{LaunchSpec, LauncherHost};
use crate::manifest::Manifest;
use crate::remote::{interpret_response, ManifestRequest, ManifestSource, RemoteUpdate};
use crate::selection::{SelectionCriteria, SelectionPolicy};
use crate::store::{AssetLease, Update, UpdateStore};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// States of the update cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UpdatesState {
    /// Nothing in flight.
    #[default]
    Idle,
    /// Querying the update endpoint.
    Checking,
    /// The check found nothing to load (transient).
    NoUpdateAvailable,
    /// The check found an update or a roll-back directive.
    UpdateAvailable,
    /// Downloading assets.
    Downloading,
    /// The download failed (transient).
    DownloadFailed,
    /// A downloaded update waits for a relaunch.
    Ready,
    /// The host is relaunching.
    Restarting,
}

impl fmt::Display for UpdatesState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "Idle",
            Self::Checking => "Checking",
            Self::NoUpdateAvailable => "NoUpdateAvailable",
            Self::UpdateAvailable => "UpdateAvailable",
            Self::Downloading => "Downloading",
            Self::DownloadFailed => "DownloadFailed",
            Self::Ready => "Ready",
            Self::Restarting => "Restarting",
        };
        f.write_str(name)
    }
}

/// Outcome of a successful check.
#[derive(Debug, Clone)]
pub enum CheckResult {
    /// A newer update can be fetched.
    UpdateAvailable(Box<Manifest>),
    /// The server asked for the embedded update; fetch to prepare it.
    RollBackToEmbedded {
        /// When the directive was issued.
        commit_time: DateTime<Utc>,
    },
    /// Nothing newer than what is running.
    NoUpdateAvailable,
}

/// Outcome of a successful fetch.
#[derive(Debug, Clone)]
pub struct FetchResult {
    /// The update that will run after a relaunch.
    pub update: Update,
    /// Whether this prepares a return to the embedded update.
    pub is_rollback: bool,
}

/// Collaborators of the state machine.
pub struct StateMachineParts {
    /// Scope of the running app.
    pub scope_key: String,
    /// Runtime version of the running binary.
    pub runtime_version: String,
    /// Update store.
    pub store: UpdateStore,
    /// Code-signing verifier.
    pub verifier: CodeSigningVerifier,
    /// Manifest endpoint.
    pub manifests: Arc<dyn ManifestSource>,
    /// Asset downloader.
    pub downloader: AssetDownloader,
    /// Launch selection rules.
    pub policy: Arc<dyn SelectionPolicy>,
    /// Host relaunch primitive.
    pub host: Arc<dyn LauncherHost>,
    /// Persistence for the context.
    pub kv: Arc<dyn KeyValueStore>,
    /// Event sink.
    pub events: UpdatesEventsSender,
}

struct Register {
    state: UpdatesState,
    context: LauncherContext,
}

struct MachineInner {
    parts: StateMachineParts,
    register: Mutex<Register>,
    cancel: Mutex<CancellationToken>,
    running: Mutex<Option<AssetLease>>,
}

/// The update state machine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct UpdatesStateMachine {
    inner: Arc<MachineInner>,
}

impl fmt::Debug for UpdatesStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdatesStateMachine")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

const RESTING: &[UpdatesState] = &[
    UpdatesState::Idle,
    UpdatesState::UpdateAvailable,
    UpdatesState::Ready,
];

impl UpdatesStateMachine {
    /// Create the machine, restoring the persisted context. The restored
    /// state is always `Idle`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the key-value store fails.
    pub fn new(parts: StateMachineParts) -> Result<Self> {
        let context = LauncherContext::restore(parts.kv.as_ref())?;
        debug!(
            "Restored launcher context (sequence {}, pending: {})",
            context.sequence_number, context.is_update_pending
        );
        Ok(Self {
            inner: Arc::new(MachineInner {
                parts,
                register: Mutex::new(Register {
                    state: UpdatesState::Idle,
                    context,
                }),
                cancel: Mutex::new(CancellationToken::new()),
                running: Mutex::new(None),
            }),
        })
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> UpdatesState {
        self.inner.register.lock().state
    }

    /// Copy of the current context.
    #[must_use]
    pub fn context(&self) -> LauncherContext {
        self.inner.register.lock().context.clone()
    }

    /// Subscribe to events.
    #[must_use]
    pub fn subscribe(&self) -> UpdatesEventsChannel {
        self.inner.parts.events.subscribe()
    }

    /// Event sender shared with the rest of the core.
    #[must_use]
    pub fn events(&self) -> &UpdatesEventsSender {
        &self.inner.parts.events
    }

    /// Update store.
    #[must_use]
    pub fn store(&self) -> &UpdateStore {
        &self.inner.parts.store
    }

    /// Selection policy.
    #[must_use]
    pub fn policy(&self) -> &Arc<dyn SelectionPolicy> {
        &self.inner.parts.policy
    }

    /// Selection criteria with the persisted manifest filters.
    #[must_use]
    pub fn criteria(&self) -> SelectionCriteria {
        self.inner.criteria()
    }

    /// Cancel the check or fetch in flight, if any.
    pub fn cancel(&self) {
        // Ordered with `begin`: an operation either took its token from
        // the parent cancelled here or starts after the swap.
        let _reg = self.inner.register.lock();
        let mut token = self.inner.cancel.lock();
        token.cancel();
        *token = CancellationToken::new();
    }

    /// Update currently running: the one last launched, else the embedded
    /// update.
    #[must_use]
    pub fn launched_update(&self) -> Option<Update> {
        self.inner.launched_update()
    }

    /// Id of the update whose assets are held for the running app.
    #[must_use]
    pub fn running_update_id(&self) -> Option<Uuid> {
        self.inner.running.lock().as_ref().map(|lease| lease.update().id)
    }

    /// Record that the host launched `lease`'s update outside a restart,
    /// e.g. at cold start. A pending download that just got launched is no
    /// longer pending.
    pub fn note_launched(&self, lease: AssetLease) {
        let id = lease.update().id;
        *self.inner.running.lock() = Some(lease);

        let mut reg = self.inner.register.lock();
        let was_pending = reg
            .context
            .downloaded_manifest
            .as_ref()
            .is_some_and(|m| m.id == id);
        if was_pending {
            let state = reg.state;
            self.inner.apply(&mut reg, state, |c| {
                c.is_update_pending = false;
                c.downloaded_manifest = None;
                c.is_rollback = false;
                c.rollback_commit_time = None;
            });
        }
    }

    /// Ask the endpoint for a newer update.
    ///
    /// Legal from `Idle`, `UpdateAvailable` and `Ready`. Failures are
    /// recorded as `lastCheckError`, published as `NoUpdateAvailable` and
    /// returned; the machine always comes back to rest.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidStateTransition`] while another operation runs,
    /// [`Error::Cancelled`] if cancelled (the prior state is restored), or
    /// the network, parse or verification error that failed the check.
    pub async fn check(&self) -> Result<CheckResult> {
        let inner = &self.inner;
        let mut claim = inner.begin("check", RESTING, UpdatesState::Checking, |c| {
            c.is_checking = true;
        })?;
        let prior = claim.prior;
        let token = claim.token.clone();

        let outcome = tokio::select! {
            biased;
            () = token.cancelled() => Err(Error::Cancelled),
            result = inner.run_check() => result,
        };

        let mut reg = claim.complete();
        let now = Utc::now();
        match outcome {
            Err(Error::Cancelled) => {
                inner.apply(&mut reg, prior, |c| c.is_checking = false);
                Err(Error::Cancelled)
            }
            Err(e) => {
                warn!("Update check failed: {e}");
                let error = ContextError::from(&e);
                inner.settle(&mut reg, UpdatesState::NoUpdateAvailable, |c| {
                    c.is_checking = false;
                    c.is_update_available = false;
                    c.latest_manifest = None;
                    c.is_rollback = false;
                    c.rollback_commit_time = None;
                    c.last_check_error = Some(error);
                    c.last_checked_at = Some(now);
                });
                drop(reg);
                inner.emit_error(&e);
                Err(e)
            }
            Ok(CheckResult::NoUpdateAvailable) => {
                inner.settle(&mut reg, UpdatesState::NoUpdateAvailable, |c| {
                    c.is_checking = false;
                    c.is_update_available = false;
                    c.latest_manifest = None;
                    c.is_rollback = false;
                    c.rollback_commit_time = None;
                    c.last_check_error = None;
                    c.last_checked_at = Some(now);
                });
                Ok(CheckResult::NoUpdateAvailable)
            }
            Ok(CheckResult::UpdateAvailable(manifest)) => {
                let latest = (*manifest).clone();
                inner.apply(&mut reg, UpdatesState::UpdateAvailable, |c| {
                    c.is_checking = false;
                    c.is_update_available = true;
                    c.latest_manifest = Some(latest);
                    c.is_rollback = false;
                    c.rollback_commit_time = None;
                    c.last_check_error = None;
                    c.last_checked_at = Some(now);
                });
                Ok(CheckResult::UpdateAvailable(manifest))
            }
            Ok(CheckResult::RollBackToEmbedded { commit_time }) => {
                inner.apply(&mut reg, UpdatesState::UpdateAvailable, |c| {
                    c.is_checking = false;
                    c.is_update_available = true;
                    c.latest_manifest = None;
                    c.is_rollback = true;
                    c.rollback_commit_time = Some(commit_time);
                    c.last_check_error = None;
                    c.last_checked_at = Some(now);
                });
                Ok(CheckResult::RollBackToEmbedded { commit_time })
            }
        }
    }

    /// Download the update found by the last check and store it.
    ///
    /// Legal only from `UpdateAvailable`. All assets are fetched with
    /// bounded parallelism; the update becomes `Ready` only once every
    /// asset is stored. For a roll-back directive nothing is downloaded and
    /// the embedded update is prepared instead.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidStateTransition`] from any other state,
    /// [`Error::Cancelled`] if cancelled (the machine returns to
    /// `UpdateAvailable`), or the download or storage error.
    pub async fn fetch(&self) -> Result<FetchResult> {
        let inner = &self.inner;
        let mut claim = inner.begin("fetch", &[UpdatesState::UpdateAvailable], UpdatesState::Downloading, |c| {
            c.is_downloading = true;
        })?;
        let (latest, is_rollback) = {
            let reg = inner.register.lock();
            (reg.context.latest_manifest.clone(), reg.context.is_rollback)
        };
        let token = claim.token.clone();

        let outcome = inner.run_fetch(latest, is_rollback, &token).await;

        let mut reg = claim.complete();
        match outcome {
            Ok(update) => {
                let downloaded = update.manifest.clone();
                inner.apply(&mut reg, UpdatesState::Ready, |c| {
                    c.is_downloading = false;
                    c.is_update_pending = true;
                    c.downloaded_manifest = Some(downloaded);
                    c.last_download_error = None;
                });
                info!("Update {} ready for relaunch", update.id);
                Ok(FetchResult { update, is_rollback })
            }
            Err(Error::Cancelled) => {
                inner.apply(&mut reg, UpdatesState::UpdateAvailable, |c| {
                    c.is_downloading = false;
                });
                Err(Error::Cancelled)
            }
            Err(e) => {
                warn!("Update download failed: {e}");
                let error = ContextError::from(&e);
                inner.settle(&mut reg, UpdatesState::DownloadFailed, |c| {
                    c.is_downloading = false;
                    c.last_download_error = Some(error);
                });
                drop(reg);
                inner.emit_error(&e);
                Err(e)
            }
        }
    }

    /// Relaunch into the downloaded update.
    ///
    /// Legal only from `Ready`. The host is asked exactly once; if the
    /// relaunch fails the machine returns to `Ready` so it can be retried.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidStateTransition`] from any other state, or the
    /// store or host error.
    pub async fn restart_app_async(&self) -> Result<Update> {
        let inner = &self.inner;
        let claim = inner.begin("restart", &[UpdatesState::Ready], UpdatesState::Restarting, |c| {
            c.is_restarting = true;
        })?;
        let target = inner
            .register
            .lock()
            .context
            .downloaded_manifest
            .as_ref()
            .map(|m| m.id);

        let outcome = match target {
            Some(id) => inner.relaunch(id).await,
            None => Err(Error::NotFound("no downloaded update to relaunch into".to_string())),
        };
        inner.finish_relaunch(claim, outcome, UpdatesState::Ready)
    }

    /// Relaunch the app on the best launchable update.
    ///
    /// From `Ready` this is [`Self::restart_app_async`]; otherwise the
    /// selection policy picks the update.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidStateTransition`] while another operation runs,
    /// [`Error::NotFound`] if nothing is launchable, or the host error. On
    /// failure the prior state is restored.
    pub async fn reload(&self) -> Result<Update> {
        let inner = &self.inner;
        let claim = inner.begin("reload", RESTING, UpdatesState::Restarting, |c| {
            c.is_restarting = true;
        })?;
        let prior = claim.prior;

        let pending = inner
            .register
            .lock()
            .context
            .downloaded_manifest
            .as_ref()
            .map(|m| m.id)
            .filter(|_| prior == UpdatesState::Ready);

        let target = pending.or_else(|| {
            let criteria = inner.criteria();
            let candidates = inner.parts.store.list_candidates(&criteria.scope_key);
            inner
                .parts
                .policy
                .launchable_update(&candidates, &criteria)
                .map(|u| u.id)
        });

        let outcome = match target {
            Some(id) => inner.relaunch(id).await,
            None => Err(Error::NotFound("no launchable update".to_string())),
        };
        inner.finish_relaunch(claim, outcome, prior)
    }
}

impl MachineInner {
    fn criteria(&self) -> SelectionCriteria {
        let scope = &self.parts.scope_key;
        SelectionCriteria::new(scope.clone(), self.parts.runtime_version.clone())
            .with_filters(self.parts.store.manifest_filters(scope))
    }

    fn launched_update(&self) -> Option<Update> {
        let store = &self.parts.store;
        store
            .launched_id()
            .and_then(|id| store.get(id).ok())
            .or_else(|| store.embedded())
    }

    /// Claim the register for an operation.
    fn begin<F>(
        &self,
        operation: &'static str,
        allowed: &[UpdatesState],
        to: UpdatesState,
        mutate: F,
    ) -> Result<Claim<'_>>
    where
        F: FnOnce(&mut LauncherContext),
    {
        let mut reg = self.register.lock();
        let from = reg.state;
        if !allowed.contains(&from) {
            debug!("Rejected {operation} while {from}");
            return Err(Error::InvalidStateTransition {
                from: from.to_string(),
                operation: operation.to_string(),
            });
        }
        self.apply(&mut reg, to, mutate);
        let token = self.cancel.lock().child_token();
        Ok(Claim {
            inner: self,
            operation,
            prior: from,
            token,
            settled: false,
        })
    }

    /// Move to `to`, persist and publish.
    fn apply<F>(&self, reg: &mut Register, to: UpdatesState, mutate: F)
    where
        F: FnOnce(&mut LauncherContext),
    {
        let from = reg.state;
        mutate(&mut reg.context);
        reg.context.sequence_number += 1;
        reg.state = to;

        if let Err(e) = reg.context.persist(self.parts.kv.as_ref()) {
            warn!("Failed to persist launcher context: {e}");
        }
        info!("Updates state {from} -> {to}");
        let _ = self.parts.events.send(UpdatesEvent::StateChanged {
            state: to,
            context: Box::new(reg.context.clone()),
        });
    }

    /// Publish a transient state, then come to rest.
    fn settle<F>(&self, reg: &mut Register, transient: UpdatesState, mutate: F)
    where
        F: FnOnce(&mut LauncherContext),
    {
        self.apply(reg, transient, mutate);
        let resting = if reg.context.is_update_pending {
            UpdatesState::Ready
        } else {
            UpdatesState::Idle
        };
        self.apply(reg, resting, |_| {});
    }

    fn emit_error(&self, error: &Error) {
        let _ = self.parts.events.send(UpdatesEvent::Error {
            message: error.to_string(),
        });
    }

    async fn run_check(&self) -> Result<CheckResult> {
        let store = &self.parts.store;
        let launched = self.launched_update();
        let embedded = store.embedded();

        let request = ManifestRequest {
            current_update_id: launched.as_ref().map(|u| u.id),
            embedded_update_id: embedded.as_ref().map(|u| u.id),
            expect_signature: self
                .parts
                .verifier
                .config()
                .map(crate::code_signing::SigningConfig::expect_signature_header),
        };

        let raw = self.parts.manifests.fetch_manifest(&request).await?;
        let check = interpret_response(raw, &self.parts.verifier)?;

        if let Some(filters) = check.manifest_filters {
            if let Err(e) = store.set_manifest_filters(&self.parts.scope_key, filters) {
                warn!("Failed to persist manifest filters: {e}");
            }
        }
        let criteria = self.criteria();

        match check.update {
            RemoteUpdate::NoUpdateAvailable => Ok(CheckResult::NoUpdateAvailable),
            RemoteUpdate::Update(verified) => {
                let manifest = verified.manifest;
                if self
                    .parts
                    .policy
                    .should_load_new_update(&manifest, launched.as_ref(), &criteria)
                {
                    if let Some(stored) = store.get(manifest.id).ok().filter(Update::is_flagged_bad) {
                        warn!(
                            "Update {} failed to launch before ({} failures), not offering it again",
                            stored.id, stored.failed_launch_count
                        );
                        return Ok(CheckResult::NoUpdateAvailable);
                    }
                    info!("Update {} is available", manifest.id);
                    Ok(CheckResult::UpdateAvailable(Box::new(manifest)))
                } else {
                    debug!("Update {} is not newer than the launched update", manifest.id);
                    Ok(CheckResult::NoUpdateAvailable)
                }
            }
            RemoteUpdate::RollBackToEmbedded { commit_time } => {
                if self
                    .parts
                    .policy
                    .should_roll_back_to_embedded(commit_time, embedded.as_ref(), launched.as_ref())
                {
                    Ok(CheckResult::RollBackToEmbedded { commit_time })
                } else {
                    debug!("Ignoring roll-back directive from {commit_time}");
                    Ok(CheckResult::NoUpdateAvailable)
                }
            }
        }
    }

    async fn run_fetch(&self, latest: Option<Manifest>, is_rollback: bool, token: &CancellationToken) -> Result<Update> {
        let store = &self.parts.store;
        if is_rollback {
            return store
                .embedded()
                .ok_or_else(|| Error::NotFound("embedded update".to_string()));
        }

        let manifest = latest.ok_or_else(|| Error::NotFound("no manifest to fetch".to_string()))?;
        let update_id = manifest.id;
        if let Ok(stored) = store.get(update_id) {
            reject_flagged_bad(&stored)?;
        }
        let events = self.parts.events.clone();

        let bytes = self
            .parts
            .downloader
            .download(&manifest, store, token, |progress| {
                let _ = events.send(UpdatesEvent::AssetDownloaded {
                    update_id,
                    key: progress.key.clone(),
                    completed: progress.completed,
                    total: progress.total,
                });
            })
            .await?;

        // Past this point the store commit runs to completion so a
        // cancellation cannot race the index write.
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let store = store.clone();
        let update = Update::from_manifest(manifest, self.parts.scope_key.clone());
        let stored = tokio::task::spawn_blocking(move || store.put(update, &bytes))
            .await
            .map_err(|e| Error::Storage(format!("store task failed: {e}")))??;
        reject_flagged_bad(&stored)?;
        Ok(stored)
    }

    async fn relaunch(&self, id: Uuid) -> Result<Update> {
        let lease = self.parts.store.resolve_assets(id)?;
        let spec = LaunchSpec::from_lease(&lease);

        info!("Relaunching into update {id}");
        self.parts.host.relaunch(&spec).await?;

        if let Err(e) = self.parts.store.mark_launched(id) {
            warn!("Failed to record launch of {id}: {e}");
        }
        let update = lease.update().clone();
        *self.running.lock() = Some(lease);
        let _ = self
            .parts
            .events
            .send(UpdatesEvent::Relaunched { update_id: id });
        Ok(update)
    }

    fn finish_relaunch(&self, mut claim: Claim<'_>, outcome: Result<Update>, on_failure: UpdatesState) -> Result<Update> {
        let mut reg = claim.complete();
        match outcome {
            Ok(update) => {
                self.apply(&mut reg, UpdatesState::Idle, |c| {
                    *c = LauncherContext {
                        last_checked_at: c.last_checked_at,
                        sequence_number: c.sequence_number,
                        ..LauncherContext::default()
                    };
                });
                Ok(update)
            }
            Err(e) => {
                warn!("Relaunch failed: {e}");
                self.apply(&mut reg, on_failure, |c| c.is_restarting = false);
                drop(reg);
                self.emit_error(&e);
                Err(e)
            }
        }
    }
}

fn reject_flagged_bad(update: &Update) -> Result<()> {
    if update.is_flagged_bad() {
        return Err(Error::RejectedUpdate(format!(
            "update {} failed to launch on this device",
            update.id
        )));
    }
    Ok(())
}

/// An operation's hold on the register.
///
/// Settled by [`Claim::complete`]. Dropped unsettled, it cancels the
/// operation's token and moves the machine back to the state it was
/// claimed from with the in-flight flags cleared.
struct Claim<'a> {
    inner: &'a MachineInner,
    operation: &'static str,
    prior: UpdatesState,
    token: CancellationToken,
    settled: bool,
}

impl<'a> Claim<'a> {
    /// Lock the register to record the operation's outcome.
    fn complete(&mut self) -> MutexGuard<'a, Register> {
        self.settled = true;
        self.inner.register.lock()
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.token.cancel();
        let mut reg = self.inner.register.lock();
        warn!(
            "Abandoned {} while {}, returning to {}",
            self.operation, reg.state, self.prior
        );
        self.inner
            .apply(&mut reg, self.prior, LauncherContext::clear_in_flight);
    }
}
