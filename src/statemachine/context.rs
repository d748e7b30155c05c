//! Persisted state machine context.

use crate::error::{Error, ErrorKind, Result};
use crate::kv::{KeyValueStore, LAUNCHER_CONTEXT_KEY};
use crate::manifest::Manifest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Error recorded in the context. Survives restarts, unlike [`Error`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextError {
    /// Classification.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
}

impl From<&Error> for ContextError {
    fn from(error: &Error) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// Snapshot of the update state machine, as exposed to the app.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LauncherContext {
    /// A check is in flight.
    pub is_checking: bool,
    /// A download is in flight.
    pub is_downloading: bool,
    /// A relaunch is in flight.
    pub is_restarting: bool,
    /// The server asked for a return to the embedded update.
    pub is_rollback: bool,
    /// The last check found something to load.
    pub is_update_available: bool,
    /// An update is downloaded and will run after a relaunch.
    pub is_update_pending: bool,
    /// Manifest found by the last check.
    pub latest_manifest: Option<Manifest>,
    /// Manifest of the downloaded, pending update.
    pub downloaded_manifest: Option<Manifest>,
    /// Commit time of the roll-back directive, when `is_rollback`.
    pub rollback_commit_time: Option<DateTime<Utc>>,
    /// Why the last check failed.
    pub last_check_error: Option<ContextError>,
    /// Why the last download failed.
    pub last_download_error: Option<ContextError>,
    /// When the last check completed.
    pub last_checked_at: Option<DateTime<Utc>>,
    /// Incremented on every transition.
    pub sequence_number: u64,
}

impl LauncherContext {
    /// Load the persisted context.
    ///
    /// In-flight flags are cleared: whatever was running when the process
    /// died is gone. Results of completed operations stay visible. An
    /// unreadable context is replaced by the default.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the key-value store fails.
    pub fn restore(kv: &dyn KeyValueStore) -> Result<Self> {
        let Some(bytes) = kv.get(LAUNCHER_CONTEXT_KEY)? else {
            return Ok(Self::default());
        };
        match serde_json::from_slice::<Self>(&bytes) {
            Ok(mut context) => {
                context.clear_in_flight();
                Ok(context)
            }
            Err(e) => {
                warn!("Discarding unreadable launcher context: {e}");
                Ok(Self::default())
            }
        }
    }

    /// Clear the flags of operations in flight.
    pub fn clear_in_flight(&mut self) {
        self.is_checking = false;
        self.is_downloading = false;
        self.is_restarting = false;
    }

    /// Persist the context.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if encoding or writing fails.
    pub fn persist(&self, kv: &dyn KeyValueStore) -> Result<()> {
        let bytes = serde_json::to_vec(self)
            .map_err(|e| Error::Storage(format!("failed to encode launcher context: {e}")))?;
        kv.set(LAUNCHER_CONTEXT_KEY, &bytes)
    }
}
