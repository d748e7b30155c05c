//! Persisted index of stored updates.

use super::Update;
use crate::error::{Error, Result};
use crate::kv::{KeyValueStore, STORE_INDEX_KEY};
use crate::manifest::SelectionFilters;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::warn;
use uuid::Uuid;

/// Current on-disk format version.
pub const INDEX_FORMAT_VERSION: u32 = 1;

/// Everything the store knows apart from asset bytes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreIndex {
    /// Format version.
    pub version: u32,
    /// Stored updates by id. Only complete updates are ever inserted.
    pub updates: BTreeMap<Uuid, Update>,
    /// Update currently running, stored or embedded.
    pub launched: Option<Uuid>,
    /// Updates protected from garbage collection.
    pub pinned: BTreeSet<Uuid>,
    /// Last manifest filters received, per scope key.
    pub manifest_filters: BTreeMap<String, SelectionFilters>,
}

impl StoreIndex {
    /// Load the index, starting empty if none exists.
    ///
    /// An unreadable index is discarded with a warning: the app must keep
    /// running on its embedded update rather than fail to start.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the key-value store itself fails.
    pub fn load(kv: &dyn KeyValueStore) -> Result<Self> {
        let Some(bytes) = kv.get(STORE_INDEX_KEY)? else {
            return Ok(Self::empty());
        };

        match rmp_serde::from_slice::<Self>(&bytes) {
            Ok(index) if index.version == INDEX_FORMAT_VERSION => Ok(index),
            Ok(index) => {
                warn!(
                    "Discarding update index with unsupported version {}",
                    index.version
                );
                Ok(Self::empty())
            }
            Err(e) => {
                warn!("Discarding unreadable update index: {e}");
                Ok(Self::empty())
            }
        }
    }

    /// Atomically persist the index.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] on serialization or write failure.
    pub fn save(&self, kv: &dyn KeyValueStore) -> Result<()> {
        let bytes = rmp_serde::to_vec_named(self)
            .map_err(|e| Error::Storage(format!("failed to encode update index: {e}")))?;
        kv.set(STORE_INDEX_KEY, &bytes)
    }

    /// Empty index at the current format version.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            version: INDEX_FORMAT_VERSION,
            ..Self::default()
        }
    }

    /// Hashes referenced by any stored update.
    #[must_use]
    pub fn referenced_hashes(&self) -> HashSet<String> {
        self.updates
            .values()
            .flat_map(|u| u.assets.values().map(|a| a.hash.clone()))
            .collect()
    }
}
