//! Content-addressed asset files.
//!
//! Every asset lives at `<root>/<sha256-hex>`. A file only appears under
//! its final name once it is completely written: bytes go to a temp file
//! in the same directory, are synced, and are then renamed into place.

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Hex SHA-256 of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn is_content_address(name: &str) -> bool {
    name.len() == 64 && name.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}

/// Directory of content-addressed asset files.
#[derive(Debug, Clone)]
pub struct AssetDir {
    root: PathBuf,
}

impl AssetDir {
    /// Open (creating if needed) the asset directory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the directory cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| {
            Error::Storage(format!(
                "failed to create asset dir '{}': {e}",
                root.display()
            ))
        })?;
        Ok(Self { root })
    }

    /// Directory path.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Final path for a content hash.
    #[must_use]
    pub fn path_for(&self, hash: &str) -> PathBuf {
        self.root.join(hash)
    }

    /// Whether an asset with this hash is present.
    #[must_use]
    pub fn exists(&self, hash: &str) -> bool {
        self.path_for(hash).is_file()
    }

    /// Write `bytes` under `hash` unless already present.
    ///
    /// Returns `true` if this call created the file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if writing or renaming fails. No file is
    /// left under the final name in that case.
    pub fn write_atomic(&self, hash: &str, bytes: &[u8]) -> Result<bool> {
        let path = self.path_for(hash);
        if path.is_file() {
            debug!("Asset {hash} already present, reusing");
            return Ok(false);
        }

        let mut tmp = NamedTempFile::new_in(&self.root)
            .map_err(|e| Error::Storage(format!("failed to create temp asset file: {e}")))?;
        tmp.write_all(bytes)
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| Error::Storage(format!("failed to write asset {hash}: {e}")))?;
        tmp.persist(&path)
            .map_err(|e| Error::Storage(format!("failed to move asset {hash} into place: {}", e.error)))?;

        debug!("Wrote asset {} ({} bytes)", hash, bytes.len());
        Ok(true)
    }

    /// Delete an asset. Missing files are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the file exists but cannot be removed.
    pub fn remove(&self, hash: &str) -> Result<()> {
        match std::fs::remove_file(self.path_for(hash)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(format!("failed to delete asset {hash}: {e}"))),
        }
    }

    /// Hashes of every complete asset on disk. Temp files are skipped.
    #[must_use]
    pub fn list(&self) -> Vec<String> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to list asset dir {}: {e}", self.root.display());
                return Vec::new();
            }
        };
        entries
            .filter_map(std::result::Result::ok)
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|name| is_content_address(name))
            .collect()
    }
}
