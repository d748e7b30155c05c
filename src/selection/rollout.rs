//! Staged rollout of updates.
//!
//! The server may publish an update to only a fraction of devices by
//! setting `metadata.rolloutPercentage`. Each device derives a stable
//! bucket in `0..100` per update from its device id, so:
//! - A device gets the same answer on every check (no flapping)
//! - Devices are evenly distributed across buckets
//! - Different updates pick different device subsets

use super::{SelectionCriteria, SelectionPolicy};
use crate::manifest::Manifest;
use crate::store::Update;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Metadata key carrying the rollout percentage.
pub const ROLLOUT_PERCENTAGE_KEY: &str = "rolloutPercentage";

/// Number of rollout buckets.
const BUCKETS: u64 = 100;

/// Deterministic per-device bucket calculation.
#[derive(Debug, Clone)]
pub struct StagedRollout {
    /// Hash of the device ID for deterministic bucket calculation.
    device_id_hash: [u8; 32],
}

impl StagedRollout {
    /// Create a rollout calculator for a device.
    #[must_use]
    pub fn new(device_id: &[u8]) -> Self {
        Self {
            device_id_hash: Sha256::digest(device_id).into(),
        }
    }

    /// Bucket of this device for a given update, in `0..100`.
    #[must_use]
    pub fn bucket(&self, update_id: Uuid) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(self.device_id_hash);
        hasher.update(update_id.as_bytes());
        let hash = hasher.finalize();

        let mut first = [0u8; 8];
        first.copy_from_slice(&hash[..8]);
        u64::from_le_bytes(first) % BUCKETS
    }

    /// Whether this device is inside a rollout of `percentage` percent.
    #[must_use]
    pub fn is_admitted(&self, update_id: Uuid, percentage: f64) -> bool {
        if percentage >= 100.0 {
            return true;
        }
        if percentage <= 0.0 || percentage.is_nan() {
            return false;
        }
        #[allow(clippy::cast_precision_loss)]
        let bucket = self.bucket(update_id) as f64;
        bucket < percentage
    }

    /// Whether this device may receive the update described by `manifest`.
    ///
    /// Manifests without a rollout percentage are published to everyone.
    #[must_use]
    pub fn admits(&self, manifest: &Manifest) -> bool {
        match manifest
            .metadata
            .get(ROLLOUT_PERCENTAGE_KEY)
            .and_then(rollout_percentage)
        {
            None => true,
            Some(percentage) => {
                let admitted = self.is_admitted(manifest.id, percentage);
                debug!(
                    "Update {} at {percentage}% rollout: device bucket {} {}",
                    manifest.id,
                    self.bucket(manifest.id),
                    if admitted { "admitted" } else { "excluded" }
                );
                admitted
            }
        }
    }
}

fn rollout_percentage(value: &serde_json::Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

/// Decorates a policy, hiding updates whose rollout excludes this device.
///
/// Updates the device already launched successfully stay visible so a
/// device never loses an update it is running.
#[derive(Clone)]
pub struct StagedRolloutPolicy {
    inner: Arc<dyn SelectionPolicy>,
    rollout: StagedRollout,
}

impl std::fmt::Debug for StagedRolloutPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagedRolloutPolicy")
            .field("rollout", &self.rollout)
            .finish_non_exhaustive()
    }
}

impl StagedRolloutPolicy {
    /// Wrap `inner` for the device identified by `device_id`.
    #[must_use]
    pub fn new(inner: Arc<dyn SelectionPolicy>, device_id: &[u8]) -> Self {
        Self {
            inner,
            rollout: StagedRollout::new(device_id),
        }
    }

    fn visible(&self, update: &Update) -> bool {
        update.is_embedded || update.successful_launch_count > 0 || self.rollout.admits(&update.manifest)
    }
}

impl SelectionPolicy for StagedRolloutPolicy {
    fn launchable_update(&self, updates: &[Update], criteria: &SelectionCriteria) -> Option<Update> {
        let visible: Vec<Update> = updates.iter().filter(|u| self.visible(u)).cloned().collect();
        self.inner.launchable_update(&visible, criteria)
    }

    fn should_load_new_update(
        &self,
        candidate: &Manifest,
        launched: Option<&Update>,
        criteria: &SelectionCriteria,
    ) -> bool {
        self.rollout.admits(candidate) && self.inner.should_load_new_update(candidate, launched, criteria)
    }

    fn should_roll_back_to_embedded(
        &self,
        commit_time: DateTime<Utc>,
        embedded: Option<&Update>,
        launched: Option<&Update>,
    ) -> bool {
        self.inner.should_roll_back_to_embedded(commit_time, embedded, launched)
    }
}
