//! Digests of signatures that already verified.
//!
//! Update checks usually return the same signed body until a new update
//! is published. A digest of (key id, body, signature) is remembered after
//! a successful RSA check so that repeated responses skip it. Failures are
//! never recorded.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// SHA-256 digest identifying a verified body/signature pair.
pub type VerificationDigest = [u8; 32];

const DEFAULT_CAPACITY: usize = 64;

/// Bounded set of verified digests, least recently used evicted first.
#[derive(Clone)]
pub struct VerifiedCache {
    digests: Arc<Mutex<LruCache<VerificationDigest, ()>>>,
    hits: Arc<AtomicU64>,
}

impl VerifiedCache {
    /// Cache sized for a handful of scopes and key rotations.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Cache holding at most `capacity` digests (at least one).
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            digests: Arc::new(Mutex::new(LruCache::new(capacity))),
            hits: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Whether `digest` verified before. Counts a hit when it did.
    pub fn is_verified(&self, digest: &VerificationDigest) -> bool {
        let found = self.digests.lock().get(digest).is_some();
        if found {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Remember a digest whose signature verified.
    pub fn record(&self, digest: VerificationDigest) {
        self.digests.lock().put(digest, ());
    }

    /// Checks answered from the cache.
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Digests currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.digests.lock().len()
    }

    /// Whether no digest is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.digests.lock().is_empty()
    }
}

impl Default for VerifiedCache {
    fn default() -> Self {
        Self::new()
    }
}
