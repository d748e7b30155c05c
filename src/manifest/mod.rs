//! Update manifest model.
//!
//! A manifest is the JSON descriptor of an over-the-air update. Three wire
//! variants exist and are told apart by marker fields:
//!
//! - **Legacy**: carries a `releaseId`
//! - **New**: carries a `metadata` object
//! - **Bare**: neither (embedded, build-time manifests)
//!
//! `runtimeVersion` is kept as an opaque string. Compatibility between
//! runtime versions is decided by a [`crate::selection::RuntimeCompatibility`]
//! supplied by the caller.

mod filters;

pub use filters::SelectionFilters;

use crate::code_signing::ManifestSignature;
use crate::error::{Error, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use url::Url;
use uuid::Uuid;

/// Key used for the launch asset when the manifest does not name one.
pub const LAUNCH_ASSET_KEY: &str = "bundle";

/// Content type assumed for a launch asset without one.
pub const DEFAULT_LAUNCH_CONTENT_TYPE: &str = "application/javascript";

/// Content type assumed for an asset without one.
pub const DEFAULT_ASSET_CONTENT_TYPE: &str = "application/octet-stream";

/// Length in bytes of a SHA-256 digest.
const SHA256_LEN: usize = 32;

/// Which wire variant a manifest was parsed from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManifestVariant {
    /// Classic-updates manifest, identified by its release.
    Legacy {
        /// Release identifier.
        release_id: String,
    },
    /// Modern protocol manifest.
    New,
    /// Embedded build-time manifest.
    Bare,
}

/// One asset referenced by a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetDescriptor {
    /// Key identifying the asset within the update.
    pub key: String,
    /// Remote location. Embedded assets have none.
    pub url: Option<Url>,
    /// Declared SHA-256 digest, base64url without padding.
    pub hash: Option<String>,
    /// MIME type.
    pub content_type: String,
    /// File extension including the leading dot.
    pub file_extension: Option<String>,
}

impl AssetDescriptor {
    /// Declared hash as lowercase hex, if any.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ManifestParse`] if the declared hash is not a
    /// base64url SHA-256 digest.
    pub fn expected_hash_hex(&self) -> Result<Option<String>> {
        self.hash
            .as_deref()
            .map(|h| decode_hash(&self.key, h).map(hex::encode))
            .transpose()
    }

    fn to_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("key".to_string(), Value::String(self.key.clone()));
        if let Some(url) = &self.url {
            obj.insert("url".to_string(), Value::String(url.to_string()));
        }
        if let Some(hash) = &self.hash {
            obj.insert("hash".to_string(), Value::String(hash.clone()));
        }
        obj.insert(
            "contentType".to_string(),
            Value::String(self.content_type.clone()),
        );
        if let Some(ext) = &self.file_extension {
            obj.insert("fileExtension".to_string(), Value::String(ext.clone()));
        }
        Value::Object(obj)
    }
}

/// A parsed update manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Wire variant.
    pub variant: ManifestVariant,
    /// Unique update identifier.
    pub id: Uuid,
    /// Publication time.
    pub created_at: DateTime<Utc>,
    /// Opaque runtime version string.
    pub runtime_version: Option<String>,
    /// The JS bundle to launch.
    pub launch_asset: AssetDescriptor,
    /// Additional assets, in manifest order.
    pub assets: Vec<AssetDescriptor>,
    /// Free-form metadata. Always empty for bare manifests.
    pub metadata: Map<String, Value>,
    /// Signature delivered alongside the manifest body.
    pub signature: Option<ManifestSignature>,
}

impl Manifest {
    /// Parse a manifest from raw JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ManifestParse`] if the JSON is malformed or a
    /// required field (`id`, `launchAsset`) is absent or invalid.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(raw)
            .map_err(|e| Error::ManifestParse(format!("invalid JSON: {e}")))?;
        Self::from_json(&value)
    }

    /// Build a manifest from an already-decoded JSON value.
    ///
    /// # Errors
    ///
    /// See [`Manifest::parse`].
    pub fn from_json(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::ManifestParse("manifest must be a JSON object".to_string()))?;

        let variant = if let Some(release_id) = obj.get("releaseId") {
            let release_id = release_id
                .as_str()
                .ok_or_else(|| Error::ManifestParse("releaseId must be a string".to_string()))?;
            ManifestVariant::Legacy {
                release_id: release_id.to_string(),
            }
        } else if obj.contains_key("metadata") {
            ManifestVariant::New
        } else {
            ManifestVariant::Bare
        };

        let id = obj
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::ManifestParse("missing id".to_string()))?;
        let id = Uuid::parse_str(id)
            .map_err(|e| Error::ManifestParse(format!("id is not a UUID: {e}")))?;

        let created_at = match obj.get("createdAt").or_else(|| obj.get("commitTime")) {
            None => DateTime::UNIX_EPOCH,
            Some(v) => {
                let s = v
                    .as_str()
                    .ok_or_else(|| Error::ManifestParse("createdAt must be a string".to_string()))?;
                DateTime::parse_from_rfc3339(s)
                    .map_err(|e| Error::ManifestParse(format!("invalid createdAt: {e}")))?
                    .with_timezone(&Utc)
            }
        };

        let runtime_version = match obj.get("runtimeVersion") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(_) => {
                return Err(Error::ManifestParse(
                    "runtimeVersion must be a string".to_string(),
                ))
            }
        };

        let launch_asset = obj
            .get("launchAsset")
            .ok_or_else(|| Error::ManifestParse("missing launchAsset".to_string()))
            .and_then(|v| {
                parse_asset(v, Some(LAUNCH_ASSET_KEY), DEFAULT_LAUNCH_CONTENT_TYPE)
            })?;

        let assets = match obj.get("assets") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| parse_asset(v, None, DEFAULT_ASSET_CONTENT_TYPE))
                .collect::<Result<Vec<_>>>()?,
            Some(_) => return Err(Error::ManifestParse("assets must be an array".to_string())),
        };

        let mut seen = HashSet::new();
        for asset in std::iter::once(&launch_asset).chain(assets.iter()) {
            if !seen.insert(asset.key.as_str()) {
                return Err(Error::ManifestParse(format!(
                    "duplicate asset key: {}",
                    asset.key
                )));
            }
        }

        let metadata = match (&variant, obj.get("metadata")) {
            (ManifestVariant::Bare, _) | (_, None | Some(Value::Null)) => Map::new(),
            (_, Some(Value::Object(m))) => m.clone(),
            (_, Some(_)) => {
                return Err(Error::ManifestParse(
                    "metadata must be an object".to_string(),
                ))
            }
        };

        Ok(Self {
            variant,
            id,
            created_at,
            runtime_version,
            launch_asset,
            assets,
            metadata,
            signature: None,
        })
    }

    /// Serialize to the wire JSON shape accepted by [`Manifest::parse`].
    ///
    /// The signature is transported out of band and is not included.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("id".to_string(), Value::String(self.id.to_string()));
        obj.insert(
            "createdAt".to_string(),
            Value::String(
                self.created_at
                    .to_rfc3339_opts(SecondsFormat::AutoSi, true),
            ),
        );
        if let Some(rv) = &self.runtime_version {
            obj.insert("runtimeVersion".to_string(), Value::String(rv.clone()));
        }
        obj.insert("launchAsset".to_string(), self.launch_asset.to_json());
        obj.insert(
            "assets".to_string(),
            Value::Array(self.assets.iter().map(AssetDescriptor::to_json).collect()),
        );

        match &self.variant {
            ManifestVariant::Legacy { release_id } => {
                obj.insert("releaseId".to_string(), Value::String(release_id.clone()));
                if !self.metadata.is_empty() {
                    obj.insert("metadata".to_string(), Value::Object(self.metadata.clone()));
                }
            }
            ManifestVariant::New => {
                obj.insert("metadata".to_string(), Value::Object(self.metadata.clone()));
            }
            ManifestVariant::Bare => {}
        }

        Value::Object(obj)
    }

    /// Serialize to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.to_json())
            .map_err(|e| Error::ManifestParse(format!("failed to serialize manifest: {e}")))
    }

    /// Attach the signature the manifest was delivered with.
    #[must_use]
    pub fn with_signature(mut self, signature: Option<ManifestSignature>) -> Self {
        self.signature = signature;
        self
    }

    /// Launch asset followed by the remaining assets.
    pub fn all_assets(&self) -> impl Iterator<Item = &AssetDescriptor> {
        std::iter::once(&self.launch_asset).chain(self.assets.iter())
    }

    /// Metadata value rendered as a string, for filter comparison.
    #[must_use]
    pub fn metadata_string(&self, key: &str) -> Option<String> {
        self.metadata.get(key).map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    /// Whether this is an embedded build-time manifest.
    #[must_use]
    pub fn is_bare(&self) -> bool {
        self.variant == ManifestVariant::Bare
    }
}

fn parse_asset(value: &Value, default_key: Option<&str>, default_type: &str) -> Result<AssetDescriptor> {
    let obj = value
        .as_object()
        .ok_or_else(|| Error::ManifestParse("asset must be an object".to_string()))?;

    let key = match (obj.get("key").and_then(Value::as_str), default_key) {
        (Some(k), _) => k.to_string(),
        (None, Some(d)) => d.to_string(),
        (None, None) => return Err(Error::ManifestParse("asset is missing key".to_string())),
    };

    let url = match obj.get("url") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(
            Url::parse(s).map_err(|e| Error::ManifestParse(format!("asset {key} url: {e}")))?,
        ),
        Some(_) => {
            return Err(Error::ManifestParse(format!(
                "asset {key} url must be a string"
            )))
        }
    };

    let hash = match obj.get("hash") {
        None | Some(Value::Null) => None,
        Some(Value::String(h)) => {
            decode_hash(&key, h)?;
            Some(h.clone())
        }
        Some(_) => {
            return Err(Error::ManifestParse(format!(
                "asset {key} hash must be a string"
            )))
        }
    };

    let content_type = obj
        .get("contentType")
        .and_then(Value::as_str)
        .unwrap_or(default_type)
        .to_string();

    let file_extension = obj
        .get("fileExtension")
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(AssetDescriptor {
        key,
        url,
        hash,
        content_type,
        file_extension,
    })
}

fn decode_hash(key: &str, hash: &str) -> Result<Vec<u8>> {
    let bytes = URL_SAFE_NO_PAD
        .decode(hash.trim_end_matches('='))
        .map_err(|e| Error::ManifestParse(format!("asset {key} hash is not base64url: {e}")))?;
    if bytes.len() != SHA256_LEN {
        return Err(Error::ManifestParse(format!(
            "asset {key} hash has {} bytes, expected {SHA256_LEN}",
            bytes.len()
        )));
    }
    Ok(bytes)
}

/// Encode a SHA-256 digest the way manifests declare asset hashes.
#[must_use]
pub fn encode_hash(digest: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(digest)
}
