//! Configuration for expo-updates.

use crate::code_signing::SigningConfig;
use crate::download::DEFAULT_MAX_CONCURRENT_DOWNLOADS;
use crate::remote::HttpRemoteConfig;
use crate::store::RetentionPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// When to check for updates at launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckOnLaunch {
    /// Check on every launch.
    #[default]
    Always,
    /// Never check automatically.
    Never,
    /// Check only when the previous launch failed.
    ErrorRecoveryOnly,
}

/// Updates configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatesConfig {
    /// Root directory for update data.
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    /// Manifest endpoint.
    #[serde(default)]
    pub update_url: Option<Url>,

    /// Runtime version of this binary.
    #[serde(default = "default_runtime_version")]
    pub runtime_version: String,

    /// Scope key; defaults to the origin of `update_url`.
    #[serde(default)]
    pub scope_key: Option<String>,

    /// Channel to request updates from.
    #[serde(default)]
    pub channel: Option<String>,

    /// Platform name sent to the server.
    #[serde(default = "default_platform")]
    pub platform: String,

    /// Extra request headers.
    #[serde(default)]
    pub request_headers: BTreeMap<String, String>,

    /// Launch-time check behaviour.
    #[serde(default)]
    pub check_on_launch: CheckOnLaunch,

    /// Periodic check interval in seconds (0 disables).
    #[serde(default)]
    pub check_interval_secs: u64,

    /// Maximum concurrent asset downloads.
    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: usize,

    /// HTTP request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Code signing; unsigned updates are accepted when absent.
    #[serde(default)]
    pub code_signing: Option<CodeSigningConfig>,

    /// Garbage-collection retention.
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Staged rollout.
    #[serde(default)]
    pub rollout: RolloutConfig,

    /// Path of the embedded (build-time) manifest.
    #[serde(default)]
    pub embedded_manifest: Option<PathBuf>,

    /// Log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Code-signing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeSigningConfig {
    /// Algorithm identifier; RSA-SHA256 when absent.
    #[serde(default)]
    pub algorithm: Option<String>,

    /// Key identifier; `root` when absent.
    #[serde(default)]
    pub key_id: Option<String>,

    /// PEM public key file.
    pub public_key_path: PathBuf,
}

/// Garbage-collection retention configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Older launchable updates kept as rollback targets.
    #[serde(default = "default_keep_previous")]
    pub keep_previous: usize,
}

/// Staged rollout configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RolloutConfig {
    /// Stable device identifier; staged rollout is off when absent.
    #[serde(default)]
    pub device_id: Option<String>,
}

impl Default for UpdatesConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            update_url: None,
            runtime_version: default_runtime_version(),
            scope_key: None,
            channel: None,
            platform: default_platform(),
            request_headers: BTreeMap::new(),
            check_on_launch: CheckOnLaunch::default(),
            check_interval_secs: 0,
            max_concurrent_downloads: default_max_concurrent_downloads(),
            request_timeout_secs: default_request_timeout(),
            code_signing: None,
            retention: RetentionConfig::default(),
            rollout: RolloutConfig::default(),
            embedded_manifest: None,
            log_level: default_log_level(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            keep_previous: default_keep_previous(),
        }
    }
}

fn default_root_dir() -> PathBuf {
    directories::ProjectDirs::from("dev", "expo", "expo-updates")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".expo-updates"))
}

fn default_runtime_version() -> String {
    "1".to_string()
}

fn default_platform() -> String {
    std::env::consts::OS.to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

const fn default_max_concurrent_downloads() -> usize {
    DEFAULT_MAX_CONCURRENT_DOWNLOADS
}

const fn default_request_timeout() -> u64 {
    60
}

const fn default_keep_previous() -> usize {
    1
}

impl UpdatesConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::Error::Config(e.to_string()))
    }

    /// Save configuration to a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn to_file(&self, path: &Path) -> crate::Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| crate::Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Scope key in effect.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] if neither a scope key nor an
    /// update URL is configured.
    pub fn effective_scope_key(&self) -> crate::Result<String> {
        if let Some(scope) = &self.scope_key {
            return Ok(scope.clone());
        }
        self.update_url
            .as_ref()
            .map(|url| url.origin().ascii_serialization())
            .ok_or_else(|| crate::Error::Config("scope_key or update_url is required".to_string()))
    }

    /// Directory of content-addressed assets.
    #[must_use]
    pub fn asset_dir(&self) -> PathBuf {
        self.root_dir.join("assets")
    }

    /// Directory of the key-value store.
    #[must_use]
    pub fn state_dir(&self) -> PathBuf {
        self.root_dir.join("state")
    }

    /// HTTP transport settings.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] without an update URL.
    pub fn http_remote_config(&self) -> crate::Result<HttpRemoteConfig> {
        let update_url = self
            .update_url
            .clone()
            .ok_or_else(|| crate::Error::Config("update_url is required".to_string()))?;
        Ok(HttpRemoteConfig {
            update_url,
            runtime_version: self.runtime_version.clone(),
            platform: self.platform.clone(),
            channel: self.channel.clone(),
            request_headers: self.request_headers.clone(),
            timeout: Duration::from_secs(self.request_timeout_secs.max(1)),
        })
    }

    /// Load the code-signing key, if configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the key cannot be read or the algorithm is
    /// unknown.
    pub fn signing_config(&self) -> crate::Result<Option<SigningConfig>> {
        self.code_signing
            .as_ref()
            .map(|cs| {
                SigningConfig::from_pem_file(
                    &cs.public_key_path,
                    cs.key_id.as_deref(),
                    cs.algorithm.as_deref(),
                )
            })
            .transpose()
    }

    /// Retention policy for garbage collection.
    #[must_use]
    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            keep_previous: self.retention.keep_previous,
            ..RetentionPolicy::default()
        }
    }

    /// Periodic check interval, if enabled.
    #[must_use]
    pub fn check_interval(&self) -> Option<Duration> {
        (self.check_interval_secs > 0).then(|| Duration::from_secs(self.check_interval_secs))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = UpdatesConfig::default();
        assert_eq!(config.max_concurrent_downloads, 4);
        assert_eq!(config.request_timeout_secs, 60);
        assert_eq!(config.retention.keep_previous, 1);
        assert_eq!(config.check_on_launch, CheckOnLaunch::Always);
        assert!(config.check_interval().is_none());
        assert!(config.effective_scope_key().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: UpdatesConfig = toml::from_str(
            r#"
            update_url = "https://u.expo.dev/abc"
            runtime_version = "2.0"
            check_on_launch = "error_recovery_only"

            [retention]
            keep_previous = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.runtime_version, "2.0");
        assert_eq!(config.check_on_launch, CheckOnLaunch::ErrorRecoveryOnly);
        assert_eq!(config.retention_policy().keep_previous, 3);
        assert_eq!(config.effective_scope_key().unwrap(), "https://u.expo.dev");
        assert_eq!(config.http_remote_config().unwrap().timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("updates.toml");
        let config = UpdatesConfig {
            root_dir: dir.path().to_path_buf(),
            channel: Some("beta".to_string()),
            scope_key: Some("scope".to_string()),
            ..UpdatesConfig::default()
        };
        config.to_file(&path).unwrap();

        let loaded = UpdatesConfig::from_file(&path).unwrap();
        assert_eq!(loaded.channel.as_deref(), Some("beta"));
        assert_eq!(loaded.asset_dir(), dir.path().join("assets"));
        assert_eq!(loaded.effective_scope_key().unwrap(), "scope");
    }

    #[test]
    fn test_missing_signing_key_is_error() {
        let config = UpdatesConfig {
            code_signing: Some(CodeSigningConfig {
                algorithm: None,
                key_id: None,
                public_key_path: PathBuf::from("/nonexistent/key.pem"),
            }),
            ..UpdatesConfig::default()
        };
        assert!(config.signing_config().is_err());
    }
}
