//! Update store: persisted update records and a content-addressed asset
//! cache shared between updates.
//!
//! # Consistency
//!
//! - Asset files become visible only after an atomic rename.
//! - An update record is inserted into the index only after all of its
//!   assets are on disk, and the index itself is replaced atomically, so a
//!   reader sees an update either complete (`Ready`) or not at all.
//! - Writers and readers take *leases* on asset hashes. Garbage collection
//!   never deletes a leased asset, nor one referenced by a retained update.

mod assets;
mod index;

pub use assets::{sha256_hex, AssetDir};
pub use index::{StoreIndex, INDEX_FORMAT_VERSION};

use crate::error::{Error, Result};
use crate::kv::KeyValueStore;
use crate::manifest::{Manifest, SelectionFilters};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lifecycle status of a stored update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateStatus {
    /// Manifest verified, assets not yet stored. Never persisted.
    Pending,
    /// All assets present and verified.
    Ready,
    /// Flagged bad: launched and failed without ever succeeding.
    Failed,
    /// Currently running.
    Launched,
}

/// An asset of a stored update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredAsset {
    /// Content hash (hex SHA-256), also the file name.
    pub hash: String,
    /// MIME type.
    pub content_type: String,
    /// Size in bytes.
    pub size: u64,
}

/// A locally materialised update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    /// Update id, equal to the manifest id.
    pub id: Uuid,
    /// Scope binding the update to an app/channel.
    pub scope_key: String,
    /// Verified manifest.
    pub manifest: Manifest,
    /// Lifecycle status.
    pub status: UpdateStatus,
    /// When the assets finished downloading.
    pub downloaded_at: Option<DateTime<Utc>>,
    /// Stored assets, keyed by manifest asset key.
    pub assets: BTreeMap<String, StoredAsset>,
    /// Launches that reached a working state.
    pub successful_launch_count: u32,
    /// Launches that crashed before reaching a working state.
    pub failed_launch_count: u32,
    /// Last time the update was launched.
    pub last_accessed: Option<DateTime<Utc>>,
    /// Whether this is the build-time update shipped with the app.
    pub is_embedded: bool,
}

impl Update {
    /// Pending update for a freshly verified manifest.
    #[must_use]
    pub fn from_manifest(manifest: Manifest, scope_key: impl Into<String>) -> Self {
        Self {
            id: manifest.id,
            scope_key: scope_key.into(),
            manifest,
            status: UpdateStatus::Pending,
            downloaded_at: None,
            assets: BTreeMap::new(),
            successful_launch_count: 0,
            failed_launch_count: 0,
            last_accessed: None,
            is_embedded: false,
        }
    }

    /// The build-time update. Its assets are resolved by the host.
    #[must_use]
    pub fn embedded(manifest: Manifest, scope_key: impl Into<String>) -> Self {
        Self {
            status: UpdateStatus::Ready,
            is_embedded: true,
            ..Self::from_manifest(manifest, scope_key)
        }
    }

    /// Publication time.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.manifest.created_at
    }

    /// Whether the update failed every launch attempt so far.
    #[must_use]
    pub fn is_flagged_bad(&self) -> bool {
        self.status == UpdateStatus::Failed
            || (self.failed_launch_count > 0 && self.successful_launch_count == 0)
    }

    /// Whether the update may be chosen for launch.
    #[must_use]
    pub fn is_launchable(&self) -> bool {
        !self.is_flagged_bad() && self.status != UpdateStatus::Pending
    }

    /// Whether the update is known to run: embedded, or launched fine once.
    #[must_use]
    pub fn is_known_good(&self) -> bool {
        self.is_embedded || (self.successful_launch_count > 0 && !self.is_flagged_bad())
    }
}

/// What garbage collection must keep beyond the launched update, the
/// newest downloaded update and pinned updates.
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    /// Extra updates to protect for this run only.
    pub pinned: BTreeSet<Uuid>,
    /// Launchable updates older than the launched one to keep as rollback
    /// targets.
    pub keep_previous: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            pinned: BTreeSet::new(),
            keep_previous: 1,
        }
    }
}

/// Outcome of a garbage collection pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Update records removed.
    pub removed_updates: Vec<Uuid>,
    /// Asset files deleted.
    pub removed_assets: usize,
    /// Update records kept.
    pub retained_updates: usize,
}

struct StoreState {
    index: StoreIndex,
    leases: HashMap<String, usize>,
    embedded: Option<Update>,
}

impl StoreState {
    fn acquire(&mut self, hashes: &[String]) {
        for hash in hashes {
            *self.leases.entry(hash.clone()).or_insert(0) += 1;
        }
    }

    fn release(&mut self, hashes: &[String]) {
        for hash in hashes {
            if let Some(count) = self.leases.get_mut(hash) {
                *count -= 1;
                if *count == 0 {
                    self.leases.remove(hash);
                }
            }
        }
    }
}

struct StoreInner {
    kv: Arc<dyn KeyValueStore>,
    assets: AssetDir,
    state: Mutex<StoreState>,
}

/// Persistent update store.
#[derive(Clone)]
pub struct UpdateStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for UpdateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateStore")
            .field("assets", &self.inner.assets.root())
            .finish_non_exhaustive()
    }
}

impl UpdateStore {
    /// Open the store. Assets live in `asset_dir`; the index in `kv`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the asset directory or the key-value
    /// store cannot be accessed.
    pub fn open(asset_dir: impl Into<PathBuf>, kv: Arc<dyn KeyValueStore>) -> Result<Self> {
        let assets = AssetDir::open(asset_dir)?;
        let index = StoreIndex::load(kv.as_ref())?;
        info!(
            "Opened update store at {} ({} updates)",
            assets.root().display(),
            index.updates.len()
        );
        Ok(Self {
            inner: Arc::new(StoreInner {
                kv,
                assets,
                state: Mutex::new(StoreState {
                    index,
                    leases: HashMap::new(),
                    embedded: None,
                }),
            }),
        })
    }

    /// Register the build-time update.
    pub fn set_embedded(&self, update: Update) {
        debug!("Registered embedded update {}", update.id);
        self.inner.state.lock().embedded = Some(update);
    }

    /// The build-time update, if registered.
    #[must_use]
    pub fn embedded(&self) -> Option<Update> {
        self.inner.state.lock().embedded.clone()
    }

    /// Asset directory.
    #[must_use]
    pub fn asset_dir(&self) -> &Path {
        self.inner.assets.root()
    }

    /// Whether an asset with the given hex hash is on disk.
    #[must_use]
    pub fn has_asset(&self, hash: &str) -> bool {
        self.inner.assets.exists(hash)
    }

    /// Store an update together with its asset bytes and mark it `Ready`.
    ///
    /// Assets already on disk (by declared hash) may be omitted from
    /// `asset_bytes` and are reused. Storing an update that already exists
    /// is a no-op returning the existing record.
    ///
    /// # Errors
    ///
    /// - [`Error::HashMismatch`] if supplied bytes contradict a declared hash
    /// - [`Error::Storage`] if bytes are missing for an asset or a write
    ///   fails; files written by this call are removed again and no record
    ///   becomes visible
    pub fn put(&self, update: Update, asset_bytes: &HashMap<String, Bytes>) -> Result<Update> {
        if update.is_embedded {
            return Err(Error::Storage("the embedded update cannot be stored".to_string()));
        }

        if let Some(existing) = self.inner.state.lock().index.updates.get(&update.id) {
            debug!("Update {} already stored", update.id);
            return Ok(existing.clone());
        }

        // Resolve every asset's content address before touching the disk.
        let mut planned: Vec<(String, StoredAsset, Option<&Bytes>)> = Vec::new();
        for desc in update.manifest.all_assets() {
            let expected = desc.expected_hash_hex()?;
            let (hash, bytes) = match (asset_bytes.get(&desc.key), expected) {
                (Some(bytes), expected) => {
                    let actual = sha256_hex(bytes);
                    if let Some(expected) = expected {
                        if expected != actual {
                            return Err(Error::HashMismatch {
                                key: desc.key.clone(),
                                expected,
                                actual,
                            });
                        }
                    }
                    (actual, Some(bytes))
                }
                (None, Some(expected)) => (expected, None),
                (None, None) => {
                    return Err(Error::Storage(format!(
                        "no content supplied for asset {}",
                        desc.key
                    )))
                }
            };
            let size = bytes.map_or(0, |b| b.len() as u64);
            planned.push((
                desc.key.clone(),
                StoredAsset {
                    hash,
                    content_type: desc.content_type.clone(),
                    size,
                },
                bytes,
            ));
        }

        let hashes: Vec<String> = planned.iter().map(|(_, a, _)| a.hash.clone()).collect();
        self.inner.state.lock().acquire(&hashes);

        let result = self.write_and_commit(update, planned);

        self.inner.state.lock().release(&hashes);
        result
    }

    fn write_and_commit(
        &self,
        mut update: Update,
        planned: Vec<(String, StoredAsset, Option<&Bytes>)>,
    ) -> Result<Update> {
        let mut written = Vec::new();

        for (key, asset, bytes) in &planned {
            let outcome = match bytes {
                Some(bytes) => self.inner.assets.write_atomic(&asset.hash, bytes),
                None if self.inner.assets.exists(&asset.hash) => Ok(false),
                None => Err(Error::Storage(format!(
                    "no content supplied for asset {key} and none stored"
                ))),
            };
            match outcome {
                Ok(true) => written.push(asset.hash.clone()),
                Ok(false) => {}
                Err(e) => {
                    self.roll_back(&written);
                    return Err(e);
                }
            }
        }

        let mut assets = BTreeMap::new();
        for (key, mut asset, _) in planned {
            if asset.size == 0 {
                asset.size = std::fs::metadata(self.inner.assets.path_for(&asset.hash))
                    .map(|m| m.len())
                    .unwrap_or(0);
            }
            assets.insert(key, asset);
        }
        update.assets = assets;
        update.status = UpdateStatus::Ready;
        update.downloaded_at = Some(Utc::now());

        let mut state = self.inner.state.lock();
        let mut next = state.index.clone();
        next.updates.insert(update.id, update.clone());
        if let Err(e) = next.save(self.inner.kv.as_ref()) {
            drop(state);
            warn!("Failed to persist update {}: {e}; rolling back", update.id);
            self.roll_back(&written);
            return Err(e);
        }
        state.index = next;
        drop(state);

        info!(
            "Stored update {} ({} assets, {} new files)",
            update.id,
            update.assets.len(),
            written.len()
        );
        Ok(update)
    }

    /// Remove files written by a failed `put`, unless something else
    /// started using them in the meantime.
    fn roll_back(&self, written: &[String]) {
        let state = self.inner.state.lock();
        let referenced = state.index.referenced_hashes();
        for hash in written {
            let foreign_leases = state.leases.get(hash).copied().unwrap_or(0) > 1;
            if foreign_leases || referenced.contains(hash) {
                continue;
            }
            if let Err(e) = self.inner.assets.remove(hash) {
                warn!("Rollback could not delete asset {hash}: {e}");
            }
        }
    }

    /// Look up an update by id, including the embedded update.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if no such update exists.
    pub fn get(&self, id: Uuid) -> Result<Update> {
        let state = self.inner.state.lock();
        state
            .index
            .updates
            .get(&id)
            .cloned()
            .or_else(|| state.embedded.clone().filter(|e| e.id == id))
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Every stored update for `scope_key`, plus the embedded update if it
    /// belongs to that scope. Newest first.
    #[must_use]
    pub fn list_candidates(&self, scope_key: &str) -> Vec<Update> {
        let state = self.inner.state.lock();
        let mut out: Vec<Update> = state
            .index
            .updates
            .values()
            .filter(|u| u.scope_key == scope_key)
            .cloned()
            .collect();
        if let Some(embedded) = &state.embedded {
            if embedded.scope_key == scope_key && !out.iter().any(|u| u.id == embedded.id) {
                out.push(embedded.clone());
            }
        }
        out.sort_by(|a, b| b.created_at().cmp(&a.created_at()).then(b.id.cmp(&a.id)));
        out
    }

    /// Every stored update regardless of scope.
    #[must_use]
    pub fn all_updates(&self) -> Vec<Update> {
        self.inner.state.lock().index.updates.values().cloned().collect()
    }

    /// Id of the update currently running.
    #[must_use]
    pub fn launched_id(&self) -> Option<Uuid> {
        self.inner.state.lock().index.launched
    }

    /// Resolve asset paths for an update and protect them from garbage
    /// collection while the returned lease is alive.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown update and
    /// [`Error::Storage`] if an asset file has gone missing.
    pub fn resolve_assets(&self, id: Uuid) -> Result<AssetLease> {
        let mut state = self.inner.state.lock();

        if let Some(embedded) = state.embedded.as_ref().filter(|e| e.id == id) {
            return Ok(AssetLease {
                store: Arc::clone(&self.inner),
                update: embedded.clone(),
                paths: BTreeMap::new(),
                hashes: Vec::new(),
            });
        }

        let update = state
            .index
            .updates
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        let mut paths = BTreeMap::new();
        for (key, asset) in &update.assets {
            let path = self.inner.assets.path_for(&asset.hash);
            if !path.is_file() {
                return Err(Error::Storage(format!(
                    "asset {key} of update {id} is missing from disk"
                )));
            }
            paths.insert(key.clone(), path);
        }

        let hashes: Vec<String> = update.assets.values().map(|a| a.hash.clone()).collect();
        state.acquire(&hashes);

        Ok(AssetLease {
            store: Arc::clone(&self.inner),
            update,
            paths,
            hashes,
        })
    }

    fn mutate<F>(&self, id: Uuid, f: F) -> Result<Update>
    where
        F: FnOnce(&mut StoreIndex) -> Result<()>,
    {
        let mut state = self.inner.state.lock();
        let embedded_id = state.embedded.as_ref().map(|e| e.id);
        if !state.index.updates.contains_key(&id) && embedded_id != Some(id) {
            return Err(Error::NotFound(id.to_string()));
        }
        let mut next = state.index.clone();
        f(&mut next)?;
        next.save(self.inner.kv.as_ref())?;
        state.index = next;

        state
            .index
            .updates
            .get(&id)
            .cloned()
            .or_else(|| state.embedded.clone())
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Record that `id` is now the running update.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] or [`Error::Storage`].
    pub fn mark_launched(&self, id: Uuid) -> Result<Update> {
        self.mutate(id, |index| {
            if let Some(previous) = index.launched.and_then(|p| index.updates.get_mut(&p)) {
                if previous.status == UpdateStatus::Launched {
                    previous.status = UpdateStatus::Ready;
                }
            }
            if let Some(update) = index.updates.get_mut(&id) {
                if update.status != UpdateStatus::Failed {
                    update.status = UpdateStatus::Launched;
                }
                update.last_accessed = Some(Utc::now());
            }
            index.launched = Some(id);
            Ok(())
        })
    }

    /// Record a launch that reached a working state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] or [`Error::Storage`].
    pub fn mark_launch_succeeded(&self, id: Uuid) -> Result<Update> {
        self.mutate(id, |index| {
            if let Some(update) = index.updates.get_mut(&id) {
                update.successful_launch_count = update.successful_launch_count.saturating_add(1);
            }
            Ok(())
        })
    }

    /// Record a launch that crashed. An update that has never launched
    /// successfully is flagged `Failed` and stops being launchable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] or [`Error::Storage`].
    pub fn mark_launch_failed(&self, id: Uuid) -> Result<Update> {
        let update = self.mutate(id, |index| {
            if let Some(update) = index.updates.get_mut(&id) {
                update.failed_launch_count = update.failed_launch_count.saturating_add(1);
                if update.successful_launch_count == 0 {
                    update.status = UpdateStatus::Failed;
                }
            }
            Ok(())
        })?;
        if update.status == UpdateStatus::Failed {
            warn!("Update {id} flagged as bad after a failed launch");
        }
        Ok(update)
    }

    /// Protect an update from garbage collection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] or [`Error::Storage`].
    pub fn pin(&self, id: Uuid) -> Result<()> {
        self.mutate(id, |index| {
            index.pinned.insert(id);
            Ok(())
        })
        .map(|_| ())
    }

    /// Remove garbage-collection protection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] or [`Error::Storage`].
    pub fn unpin(&self, id: Uuid) -> Result<()> {
        self.mutate(id, |index| {
            index.pinned.remove(&id);
            Ok(())
        })
        .map(|_| ())
    }

    /// Persist the manifest filters last received for a scope.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if persisting fails.
    pub fn set_manifest_filters(&self, scope_key: &str, filters: SelectionFilters) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.index.manifest_filters.get(scope_key) == Some(&filters) {
            return Ok(());
        }
        let mut next = state.index.clone();
        next.manifest_filters.insert(scope_key.to_string(), filters);
        next.save(self.inner.kv.as_ref())?;
        state.index = next;
        Ok(())
    }

    /// Manifest filters last received for a scope.
    #[must_use]
    pub fn manifest_filters(&self, scope_key: &str) -> SelectionFilters {
        self.inner
            .state
            .lock()
            .index
            .manifest_filters
            .get(scope_key)
            .cloned()
            .unwrap_or_default()
    }

    /// Remove superseded updates and unreferenced assets.
    ///
    /// Retained: the launched update; the most recently downloaded `Ready`
    /// update of each scope; pinned updates (persisted and per-call); and
    /// up to `keep_previous` launchable updates older than the launched
    /// one. Assets referenced by retained updates or held by a lease are
    /// never deleted. Orphaned files left by a crash are removed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the pruned index cannot be persisted;
    /// nothing is deleted in that case.
    pub fn garbage_collect(&self, policy: &RetentionPolicy) -> Result<GcReport> {
        let mut state = self.inner.state.lock();
        let index = &state.index;

        let mut retained: HashSet<Uuid> = HashSet::new();
        retained.extend(index.launched);
        retained.extend(index.pinned.iter().copied());
        retained.extend(policy.pinned.iter().copied());

        let mut newest_ready: HashMap<&str, &Update> = HashMap::new();
        for update in index.updates.values().filter(|u| u.status == UpdateStatus::Ready) {
            let slot = newest_ready.entry(update.scope_key.as_str()).or_insert(update);
            if (update.downloaded_at, update.created_at()) > (slot.downloaded_at, slot.created_at()) {
                *slot = update;
            }
        }
        retained.extend(newest_ready.values().map(|u| u.id));

        let launched = index
            .launched
            .and_then(|id| index.updates.get(&id).or(state.embedded.as_ref().filter(|e| e.id == id)));
        if let Some(launched) = launched {
            let mut older: Vec<&Update> = index
                .updates
                .values()
                .filter(|u| {
                    u.scope_key == launched.scope_key
                        && u.id != launched.id
                        && u.created_at() < launched.created_at()
                        && u.is_launchable()
                })
                .collect();
            older.sort_by(|a, b| b.created_at().cmp(&a.created_at()));
            retained.extend(older.into_iter().take(policy.keep_previous).map(|u| u.id));
        }

        let mut next = index.clone();
        let removed_updates: Vec<Uuid> = next
            .updates
            .keys()
            .filter(|id| !retained.contains(id))
            .copied()
            .collect();
        for id in &removed_updates {
            next.updates.remove(id);
        }
        next.pinned.retain(|id| next.updates.contains_key(id));

        if !removed_updates.is_empty() {
            next.save(self.inner.kv.as_ref())?;
        }
        state.index = next;

        // Deleting under the lock keeps a concurrent `put` from reusing a
        // file between our check and the unlink.
        let referenced = state.index.referenced_hashes();
        let mut removed_assets = 0;
        for hash in self.inner.assets.list() {
            if referenced.contains(&hash) || state.leases.contains_key(&hash) {
                continue;
            }
            match self.inner.assets.remove(&hash) {
                Ok(()) => removed_assets += 1,
                Err(e) => warn!("Garbage collection could not delete asset {hash}: {e}"),
            }
        }

        let report = GcReport {
            removed_updates,
            removed_assets,
            retained_updates: state.index.updates.len(),
        };
        info!(
            "Garbage collection removed {} updates and {} assets",
            report.removed_updates.len(),
            report.removed_assets
        );
        Ok(report)
    }
}

/// Resolved asset paths of one update, protected from garbage collection
/// until dropped.
pub struct AssetLease {
    store: Arc<StoreInner>,
    update: Update,
    paths: BTreeMap<String, PathBuf>,
    hashes: Vec<String>,
}

impl AssetLease {
    /// The leased update.
    #[must_use]
    pub fn update(&self) -> &Update {
        &self.update
    }

    /// Asset paths by manifest key. Empty for the embedded update.
    #[must_use]
    pub fn paths(&self) -> &BTreeMap<String, PathBuf> {
        &self.paths
    }

    /// Path of the launch asset, if stored locally.
    #[must_use]
    pub fn launch_asset_path(&self) -> Option<&Path> {
        self.paths
            .get(&self.update.manifest.launch_asset.key)
            .map(PathBuf::as_path)
    }
}

impl std::fmt::Debug for AssetLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetLease")
            .field("update", &self.update.id)
            .field("paths", &self.paths)
            .finish_non_exhaustive()
    }
}

impl Drop for AssetLease {
    fn drop(&mut self) {
        self.store.state.lock().release(&self.hashes);
    }
}
