//! Selection policy: which update to launch, and whether a freshly
//! checked manifest is worth loading.
//!
//! Policies are pluggable through [`SelectionPolicy`] so deployment rules
//! (rollback behaviour, staged rollout) can change without touching the
//! state machine.
//!
//! ## Policies
//!
//! - [`NewestUpdatePolicy`]: newest launchable update matching the scope,
//!   runtime version and manifest filters
//! - [`RollbackSelectionPolicy`]: like the default, but when the newest
//!   update is flagged bad it falls back to the newest known-good one
//! - [`StagedRolloutPolicy`]: admits an update to a device only when the
//!   device falls inside the update's rollout percentage

mod rollout;

pub use rollout::{StagedRollout, StagedRolloutPolicy, ROLLOUT_PERCENTAGE_KEY};

use crate::manifest::{Manifest, SelectionFilters};
use crate::store::Update;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::debug;

/// Decides whether a manifest's runtime version can run on this binary.
///
/// Runtime versions are opaque strings; the comparison belongs to the host.
pub trait RuntimeCompatibility: Send + Sync {
    /// Whether an update built for `candidate` can run on `configured`.
    fn is_compatible(&self, configured: &str, candidate: &str) -> bool;
}

/// Runtime versions must be byte-for-byte equal.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactRuntimeMatch;

impl RuntimeCompatibility for ExactRuntimeMatch {
    fn is_compatible(&self, configured: &str, candidate: &str) -> bool {
        configured == candidate
    }
}

/// Query-time inputs to selection.
#[derive(Debug, Clone)]
pub struct SelectionCriteria {
    /// Scope the running app belongs to.
    pub scope_key: String,
    /// Runtime version of the running binary.
    pub runtime_version: String,
    /// Manifest filters last received from the server.
    pub filters: SelectionFilters,
}

impl SelectionCriteria {
    /// Criteria without filters.
    #[must_use]
    pub fn new(scope_key: impl Into<String>, runtime_version: impl Into<String>) -> Self {
        Self {
            scope_key: scope_key.into(),
            runtime_version: runtime_version.into(),
            filters: SelectionFilters::new(),
        }
    }

    /// Replace the filters.
    #[must_use]
    pub fn with_filters(mut self, filters: SelectionFilters) -> Self {
        self.filters = filters;
        self
    }
}

/// Pluggable launch-selection rules.
pub trait SelectionPolicy: Send + Sync {
    /// Pick the update to launch from `updates`, or `None` if nothing
    /// qualifies.
    fn launchable_update(&self, updates: &[Update], criteria: &SelectionCriteria) -> Option<Update>;

    /// Whether a freshly checked manifest should replace the launched
    /// update.
    fn should_load_new_update(
        &self,
        candidate: &Manifest,
        launched: Option<&Update>,
        criteria: &SelectionCriteria,
    ) -> bool;

    /// Whether a roll-back-to-embedded directive published at
    /// `commit_time` should be honoured.
    fn should_roll_back_to_embedded(
        &self,
        commit_time: DateTime<Utc>,
        embedded: Option<&Update>,
        launched: Option<&Update>,
    ) -> bool {
        let Some(embedded) = embedded else {
            return false;
        };
        match launched {
            None => true,
            Some(launched) if launched.id == embedded.id => false,
            Some(launched) => commit_time > launched.created_at(),
        }
    }
}

/// Newest-first ordering with the greater id winning ties.
fn newer(a: &Update, b: &Update) -> Ordering {
    a.created_at()
        .cmp(&b.created_at())
        .then_with(|| a.id.cmp(&b.id))
}

/// Default policy: the newest launchable update that matches.
#[derive(Clone)]
pub struct NewestUpdatePolicy {
    compatibility: Arc<dyn RuntimeCompatibility>,
}

impl std::fmt::Debug for NewestUpdatePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewestUpdatePolicy").finish_non_exhaustive()
    }
}

impl Default for NewestUpdatePolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl NewestUpdatePolicy {
    /// Policy comparing runtime versions exactly.
    #[must_use]
    pub fn new() -> Self {
        Self::with_compatibility(Arc::new(ExactRuntimeMatch))
    }

    /// Policy with a host-supplied runtime comparison.
    #[must_use]
    pub fn with_compatibility(compatibility: Arc<dyn RuntimeCompatibility>) -> Self {
        Self { compatibility }
    }

    /// Whether a manifest can run here and passes the filters.
    ///
    /// Embedded manifests are built for this binary and skip the runtime
    /// check.
    #[must_use]
    pub fn manifest_matches(&self, manifest: &Manifest, criteria: &SelectionCriteria, embedded: bool) -> bool {
        if !criteria.filters.matches(manifest) {
            return false;
        }
        if embedded {
            return true;
        }
        manifest
            .runtime_version
            .as_deref()
            .is_some_and(|rv| self.compatibility.is_compatible(&criteria.runtime_version, rv))
    }

    /// Whether a stored update matches scope, runtime and filters,
    /// regardless of its launch history.
    #[must_use]
    pub fn update_matches(&self, update: &Update, criteria: &SelectionCriteria) -> bool {
        update.scope_key == criteria.scope_key
            && self.manifest_matches(&update.manifest, criteria, update.is_embedded)
    }
}

impl SelectionPolicy for NewestUpdatePolicy {
    fn launchable_update(&self, updates: &[Update], criteria: &SelectionCriteria) -> Option<Update> {
        let chosen = updates
            .iter()
            .filter(|u| u.is_launchable() && self.update_matches(u, criteria))
            .max_by(|a, b| newer(a, b))
            .cloned();
        debug!(
            "Selected {:?} from {} candidates",
            chosen.as_ref().map(|u| u.id),
            updates.len()
        );
        chosen
    }

    fn should_load_new_update(
        &self,
        candidate: &Manifest,
        launched: Option<&Update>,
        criteria: &SelectionCriteria,
    ) -> bool {
        if !self.manifest_matches(candidate, criteria, false) {
            return false;
        }
        let Some(launched) = launched else {
            return true;
        };
        // A launched update that no longer passes the filters is replaced
        // by anything that does.
        if !criteria.filters.matches(&launched.manifest) {
            return true;
        }
        candidate.id != launched.id && candidate.created_at > launched.created_at()
    }
}

/// Falls back to the newest known-good update when the newest matching
/// update is flagged bad.
///
/// Known-good means embedded or launched successfully at least once. The
/// bad-update signal comes from the host through
/// [`crate::store::UpdateStore::mark_launch_failed`].
#[derive(Debug, Clone, Default)]
pub struct RollbackSelectionPolicy {
    base: NewestUpdatePolicy,
}

impl RollbackSelectionPolicy {
    /// Wrap a base policy whose matching rules are reused.
    #[must_use]
    pub fn new(base: NewestUpdatePolicy) -> Self {
        Self { base }
    }
}

impl SelectionPolicy for RollbackSelectionPolicy {
    fn launchable_update(&self, updates: &[Update], criteria: &SelectionCriteria) -> Option<Update> {
        let mut matching: Vec<&Update> = updates
            .iter()
            .filter(|u| self.base.update_matches(u, criteria))
            .collect();
        matching.sort_by(|a, b| newer(b, a));

        let newest = matching.first()?;
        if !newest.is_flagged_bad() && newest.is_launchable() {
            return Some((*newest).clone());
        }

        let fallback = matching.iter().find(|u| u.is_known_good()).map(|u| (*u).clone());
        debug!(
            "Newest update {} is flagged bad, rolling back to {:?}",
            newest.id,
            fallback.as_ref().map(|u| u.id)
        );
        fallback
    }

    fn should_load_new_update(
        &self,
        candidate: &Manifest,
        launched: Option<&Update>,
        criteria: &SelectionCriteria,
    ) -> bool {
        self.base.should_load_new_update(candidate, launched, criteria)
    }
}
