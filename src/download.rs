//! Bounded-parallel asset downloads.
//!
//! All assets of one update are fetched concurrently, at most
//! `max_concurrent` at a time. The first failure aborts the whole batch:
//! in-flight downloads are dropped and nothing is handed to the store, so
//! a failed or cancelled fetch never produces a partial update.

use crate::error::{Error, Result};
use crate::manifest::{AssetDescriptor, Manifest};
use crate::remote::AssetSource;
use crate::store::{sha256_hex, UpdateStore};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Default download parallelism.
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 4;

/// Progress of a batch, reported after each completed asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadProgress {
    /// Key of the asset that just finished.
    pub key: String,
    /// Assets finished so far.
    pub completed: usize,
    /// Assets in the batch.
    pub total: usize,
}

/// Downloads the assets of a manifest.
#[derive(Clone)]
pub struct AssetDownloader {
    source: Arc<dyn AssetSource>,
    max_concurrent: usize,
}

impl std::fmt::Debug for AssetDownloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetDownloader")
            .field("max_concurrent", &self.max_concurrent)
            .finish_non_exhaustive()
    }
}

impl AssetDownloader {
    /// Create a downloader (parallelism of at least 1).
    #[must_use]
    pub fn new(source: Arc<dyn AssetSource>, max_concurrent: usize) -> Self {
        Self {
            source,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Maximum concurrent downloads.
    #[must_use]
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Fetch every asset of `manifest` not already in `store`.
    ///
    /// Returned bytes are checked against declared hashes. Assets that the
    /// store already holds (by declared hash) are skipped.
    ///
    /// # Errors
    ///
    /// Returns the first download or hash failure, or [`Error::Cancelled`]
    /// if `cancel` fires first.
    pub async fn download<F>(
        &self,
        manifest: &Manifest,
        store: &UpdateStore,
        cancel: &CancellationToken,
        on_progress: F,
    ) -> Result<HashMap<String, Bytes>>
    where
        F: Fn(&DownloadProgress) + Send + Sync,
    {
        let mut pending: Vec<(AssetDescriptor, Option<String>)> = Vec::new();
        for asset in manifest.all_assets() {
            let expected = asset.expected_hash_hex()?;
            if expected.as_deref().is_some_and(|h| store.has_asset(h)) {
                debug!("Asset {} already stored, skipping download", asset.key);
                continue;
            }
            pending.push((asset.clone(), expected));
        }

        let total = pending.len();
        info!(
            "Downloading {total} assets for update {} ({} concurrent)",
            manifest.id, self.max_concurrent
        );

        let mut downloads = stream::iter(pending)
            .map(|(asset, expected)| {
                let source = Arc::clone(&self.source);
                async move {
                    let bytes = source.fetch_asset(&asset).await?;
                    if let Some(expected) = expected {
                        let actual = sha256_hex(&bytes);
                        if actual != expected {
                            return Err(Error::HashMismatch {
                                key: asset.key,
                                expected,
                                actual,
                            });
                        }
                    }
                    Ok((asset.key, bytes))
                }
            })
            .buffer_unordered(self.max_concurrent);

        let mut results = HashMap::with_capacity(total);
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    info!("Asset download for update {} cancelled", manifest.id);
                    return Err(Error::Cancelled);
                }
                next = downloads.next() => {
                    let Some(result) = next else { break };
                    let (key, bytes) = result?;
                    debug!("Downloaded asset {key} ({} bytes)", bytes.len());
                    results.insert(key.clone(), bytes);
                    on_progress(&DownloadProgress {
                        key,
                        completed: results.len(),
                        total,
                    });
                }
            }
        }

        Ok(results)
    }
}
