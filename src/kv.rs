//! Key-value persistence seam.
//!
//! The host platform provides secure storage; the updates core only needs
//! a small key-value interface with atomic replacement of a value. The
//! store index and the launcher context are both kept here.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

/// Key under which the update store index is persisted.
pub const STORE_INDEX_KEY: &str = "updates.index";

/// Key under which the launcher context is persisted.
pub const LAUNCHER_CONTEXT_KEY: &str = "updates.context";

/// Byte-oriented key-value storage with atomic per-key replacement.
pub trait KeyValueStore: Send + Sync {
    /// Read a value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the backing storage fails.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Atomically replace a value. Readers observe either the old or the
    /// new value, never a mix.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the write fails; the old value stays.
    fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Remove a value. Removing a missing key is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the backing storage fails.
    fn remove(&self, key: &str) -> Result<()>;
}

/// One file per key inside a directory; writes go through a temp file and
/// a rename.
#[derive(Debug)]
pub struct FileKeyValueStore {
    dir: PathBuf,
}

impl FileKeyValueStore {
    /// Open (creating if needed) a store rooted at `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| {
            Error::Storage(format!("failed to create kv dir '{}': {e}", dir.display()))
        })?;
        Ok(Self { dir })
    }

    /// Directory holding the values.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty()
            || !key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
            || key.starts_with('.')
        {
            return Err(Error::Storage(format!("invalid kv key: {key:?}")));
        }
        Ok(self.dir.join(key))
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Storage(format!(
                "failed to read '{}': {e}",
                path.display()
            ))),
        }
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        let mut tmp = NamedTempFile::new_in(&self.dir)
            .map_err(|e| Error::Storage(format!("failed to create temp file: {e}")))?;
        tmp.write_all(value)
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| Error::Storage(format!("failed to write '{key}': {e}")))?;
        tmp.persist(&path)
            .map_err(|e| Error::Storage(format!("failed to persist '{key}': {}", e.error)))?;
        debug!("Persisted {} bytes to {}", value.len(), path.display());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(format!(
                "failed to remove '{}': {e}",
                path.display()
            ))),
        }
    }
}

/// In-memory store for tests and hosts without persistence.
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    values: Mutex<HashMap<String, Vec<u8>>>,
    fail_writes: Mutex<bool>,
}

impl MemoryKeyValueStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `set` fail, simulating a full disk.
    pub fn set_fail_writes(&self, fail: bool) {
        *self.fail_writes.lock() = fail;
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        if *self.fail_writes.lock() {
            return Err(Error::Storage(format!("simulated write failure for '{key}'")));
        }
        self.values.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.values.lock().remove(key);
        Ok(())
    }
}
