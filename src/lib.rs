//! # expo-updates
//!
//! Over-the-air update client core for Expo apps.
//!
//! ## Overview
//!
//! An app ships with an embedded bundle and asks an update endpoint for
//! newer ones. This crate decides what to download, verifies it, keeps it
//! on disk, picks what to launch and drives the check/download/relaunch
//! cycle:
//!
//! - **Manifests**: parse and serialize update manifests ([`manifest`])
//! - **Code signing**: RSA-SHA256 verification of manifest bodies ([`code_signing`])
//! - **Store**: content-addressed assets plus an update index ([`store`])
//! - **Selection**: which update runs, with rollback and staged rollout ([`selection`])
//! - **State machine**: one check, fetch or relaunch at a time ([`statemachine`])
//! - **Launcher**: host and app bindings ([`launcher`])
//!
//! ## Example
//!
//! ```rust,ignore
//! use expo_updates::{UpdatesBuilder, UpdatesConfig};
//!
//! let config = UpdatesConfig::from_file("updates.toml".as_ref())?;
//! let mut updates = UpdatesBuilder::new(config, host).build()?;
//! let spec = updates.launch()?;
//! updates.run().await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod code_signing;
pub mod config;
pub mod controller;
pub mod download;
pub mod error;
pub mod event;
pub mod headers;
pub mod kv;
pub mod launcher;
pub mod manifest;
pub mod remote;
pub mod selection;
pub mod statemachine;
pub mod store;

pub use code_signing::{CodeSigningVerifier, SigningConfig};
pub use config::{CheckOnLaunch, UpdatesConfig};
pub use controller::{RunningUpdates, UpdatesBuilder};
pub use error::{Error, ErrorKind, Result};
pub use event::{add_listener, Subscription, UpdatesEvent};
pub use kv::{FileKeyValueStore, KeyValueStore, MemoryKeyValueStore};
pub use launcher::{LaunchSpec, LauncherHost, UpdatesLauncher, UpdatesModule};
pub use manifest::Manifest;
pub use selection::{NewestUpdatePolicy, SelectionPolicy};
pub use statemachine::{LauncherContext, UpdatesState, UpdatesStateMachine};
pub use store::{Update, UpdateStore};
