//! Host binding that publishes the active update as a pointer file.
//!
//! A supervising process watches `current.json` and restarts the app on
//! the bundle it names.

use async_trait::async_trait;
use expo_updates::{Error, LaunchSpec, LauncherHost, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

const POINTER_FILE: &str = "current.json";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Pointer<'a> {
    update_id: Uuid,
    is_embedded: bool,
    launch_asset: Option<&'a Path>,
    assets: &'a BTreeMap<String, PathBuf>,
}

/// Writes the launched update to `<root>/current.json`.
#[derive(Debug, Clone)]
pub struct DirectoryHost {
    root: PathBuf,
}

impl DirectoryHost {
    /// Host publishing into `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Publish `spec` as the active update.
    pub fn publish(&self, spec: &LaunchSpec) -> Result<()> {
        let pointer = Pointer {
            update_id: spec.update.id,
            is_embedded: spec.is_embedded(),
            launch_asset: spec.launch_asset.as_deref(),
            assets: &spec.assets,
        };
        let json = serde_json::to_vec_pretty(&pointer)
            .map_err(|e| Error::Host(format!("failed to encode launch pointer: {e}")))?;

        std::fs::create_dir_all(&self.root)?;
        let path = self.root.join(POINTER_FILE);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

#[async_trait]
impl LauncherHost for DirectoryHost {
    async fn relaunch(&self, spec: &LaunchSpec) -> Result<()> {
        self.publish(spec)
            .map_err(|e| Error::Host(format!("relaunch into {} failed: {e}", spec.update.id)))?;
        info!("Published update {} to {}", spec.update.id, self.root.display());
        Ok(())
    }
}
