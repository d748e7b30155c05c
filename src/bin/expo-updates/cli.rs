//! Command-line interface definition.

use clap::{Parser, Subcommand, ValueEnum};
use expo_updates::config::{CheckOnLaunch, UpdatesConfig};
use std::path::PathBuf;
use url::Url;
use uuid::Uuid;

/// Over-the-air update client for Expo apps.
#[derive(Parser, Debug)]
#[command(name = "expo-updates")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Root directory for update data.
    #[arg(long, global = true, env = "EXPO_UPDATES_ROOT_DIR")]
    pub root_dir: Option<PathBuf>,

    /// Manifest endpoint.
    #[arg(long, global = true, env = "EXPO_UPDATES_URL")]
    pub update_url: Option<Url>,

    /// Runtime version of the app binary.
    #[arg(long, global = true, env = "EXPO_UPDATES_RUNTIME_VERSION")]
    pub runtime_version: Option<String>,

    /// Scope key (defaults to the origin of the update URL).
    #[arg(long, global = true, env = "EXPO_UPDATES_SCOPE_KEY")]
    pub scope_key: Option<String>,

    /// Release channel.
    #[arg(long, global = true, env = "EXPO_UPDATES_CHANNEL")]
    pub channel: Option<String>,

    /// Embedded manifest file.
    #[arg(long, global = true, env = "EXPO_UPDATES_EMBEDDED_MANIFEST")]
    pub embedded_manifest: Option<PathBuf>,

    /// PEM public key for code signing.
    #[arg(long, global = true, env = "EXPO_UPDATES_PUBLIC_KEY")]
    pub public_key: Option<PathBuf>,

    /// Log level.
    #[arg(long, global = true, default_value = "info", env = "RUST_LOG")]
    pub log_level: String,

    /// Path to configuration file.
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// What to do.
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Launch the selected update and keep checking until interrupted.
    Run {
        /// Launch-time check behaviour.
        #[arg(long, value_enum, env = "EXPO_UPDATES_CHECK_ON_LAUNCH")]
        check_on_launch: Option<CliCheckOnLaunch>,

        /// Seconds between background checks (0 disables).
        #[arg(long, env = "EXPO_UPDATES_CHECK_INTERVAL")]
        check_interval: Option<u64>,
    },
    /// Ask the endpoint for a newer update.
    Check,
    /// Check and download a newer update.
    Fetch {
        /// Relaunch into the update once it is downloaded.
        #[arg(long)]
        apply: bool,
    },
    /// Print the persisted state machine context.
    Status,
    /// List stored updates.
    List,
    /// Remove updates and assets that are no longer needed.
    Gc,
    /// Keep an update through garbage collection.
    Pin {
        /// Update id.
        id: Uuid,
    },
    /// Release a pinned update.
    Unpin {
        /// Update id.
        id: Uuid,
    },
    /// Record the outcome of the last launch.
    MarkLaunch {
        /// Whether the launch failed.
        #[arg(long)]
        failed: bool,
    },
}

/// Check-on-launch CLI enum.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum CliCheckOnLaunch {
    /// Check on every launch.
    Always,
    /// Never check automatically.
    Never,
    /// Check only after a failed launch.
    ErrorRecoveryOnly,
}

impl Cli {
    /// Convert CLI arguments into an `UpdatesConfig`.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file is specified but cannot be loaded.
    pub fn to_config(&self) -> color_eyre::Result<UpdatesConfig> {
        // Start with default config or load from file
        let mut config = if let Some(ref path) = self.config {
            UpdatesConfig::from_file(path)?
        } else {
            UpdatesConfig::default()
        };

        // Override with CLI arguments
        if let Some(root_dir) = &self.root_dir {
            config.root_dir.clone_from(root_dir);
        }
        if let Some(url) = &self.update_url {
            config.update_url = Some(url.clone());
        }
        if let Some(runtime_version) = &self.runtime_version {
            config.runtime_version.clone_from(runtime_version);
        }
        if self.scope_key.is_some() {
            config.scope_key.clone_from(&self.scope_key);
        }
        if self.channel.is_some() {
            config.channel.clone_from(&self.channel);
        }
        if self.embedded_manifest.is_some() {
            config.embedded_manifest.clone_from(&self.embedded_manifest);
        }
        if let Some(public_key) = &self.public_key {
            config.code_signing = Some(expo_updates::config::CodeSigningConfig {
                algorithm: None,
                key_id: None,
                public_key_path: public_key.clone(),
            });
        }
        config.log_level.clone_from(&self.log_level);

        if let Command::Run {
            check_on_launch,
            check_interval,
        } = &self.command
        {
            if let Some(mode) = check_on_launch {
                config.check_on_launch = (*mode).into();
            }
            if let Some(secs) = check_interval {
                config.check_interval_secs = *secs;
            }
        }

        Ok(config)
    }
}

impl From<CliCheckOnLaunch> for CheckOnLaunch {
    fn from(mode: CliCheckOnLaunch) -> Self {
        match mode {
            CliCheckOnLaunch::Always => Self::Always,
            CliCheckOnLaunch::Never => Self::Never,
            CliCheckOnLaunch::ErrorRecoveryOnly => Self::ErrorRecoveryOnly,
        }
    }
}
