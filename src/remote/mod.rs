//! Remote update endpoint.
//!
//! [`ManifestSource`] and [`AssetSource`] are the network seam: the HTTP
//! implementation lives in [`http`], tests substitute in-process mocks.
//! Transports return raw bodies and headers; [`interpret_response`] turns
//! them into a verified outcome so every transport gets identical
//! code-signing and filter checks.

pub mod http;

pub use http::{HttpRemote, HttpRemoteConfig};

use crate::code_signing::{CodeSigningVerifier, ManifestSignature, VerifiedManifest};
use crate::error::{Error, Result};
use crate::manifest::{AssetDescriptor, Manifest, SelectionFilters};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

/// Response header carrying manifest filters.
pub const MANIFEST_FILTERS_HEADER: &str = "expo-manifest-filters";

/// Directive type rolling the app back to its embedded update.
pub const DIRECTIVE_ROLL_BACK_TO_EMBEDDED: &str = "rollBackToEmbedded";

/// Directive type stating that no update is available.
pub const DIRECTIVE_NO_UPDATE_AVAILABLE: &str = "noUpdateAvailable";

/// Per-request context sent with a manifest request.
#[derive(Debug, Clone, Default)]
pub struct ManifestRequest {
    /// Update currently running.
    pub current_update_id: Option<Uuid>,
    /// Update embedded in the binary.
    pub embedded_update_id: Option<Uuid>,
    /// `expo-expect-signature` value when code signing is configured.
    pub expect_signature: Option<String>,
}

/// Raw response from the update endpoint.
#[derive(Debug, Clone, Default)]
pub struct RawManifestResponse {
    /// Response body; `None` when the server answered 204 No Content.
    pub body: Option<Bytes>,
    /// `expo-signature` header.
    pub signature: Option<String>,
    /// `expo-manifest-filters` header.
    pub manifest_filters: Option<String>,
}

impl RawManifestResponse {
    /// Response for a plain body without headers.
    #[must_use]
    pub fn with_body(body: impl Into<Bytes>) -> Self {
        Self {
            body: Some(body.into()),
            ..Self::default()
        }
    }

    /// 204 No Content.
    #[must_use]
    pub fn no_content() -> Self {
        Self::default()
    }
}

/// What a check found.
#[derive(Debug, Clone)]
pub enum RemoteUpdate {
    /// Nothing to do.
    NoUpdateAvailable,
    /// A verified manifest.
    Update(VerifiedManifest),
    /// The server asks the app to return to its embedded update.
    RollBackToEmbedded {
        /// When the directive was issued.
        commit_time: DateTime<Utc>,
    },
}

/// Interpreted response: outcome plus the filters delivered with it.
#[derive(Debug, Clone)]
pub struct RemoteCheck {
    /// Outcome of the check.
    pub update: RemoteUpdate,
    /// Filters from the `expo-manifest-filters` header.
    pub manifest_filters: Option<SelectionFilters>,
}

/// Source of manifests.
#[async_trait]
pub trait ManifestSource: Send + Sync {
    /// Request the latest manifest.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Network`] on transport failure.
    async fn fetch_manifest(&self, request: &ManifestRequest) -> Result<RawManifestResponse>;
}

/// Source of asset bytes.
#[async_trait]
pub trait AssetSource: Send + Sync {
    /// Download one asset.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Network`] on transport failure.
    async fn fetch_asset(&self, asset: &AssetDescriptor) -> Result<Bytes>;
}

/// Verify and classify a raw response.
///
/// The signature covers the body exactly as received, or `manifestString`
/// for a legacy envelope. Nothing is parsed as a manifest before the
/// signature has been checked.
///
/// # Errors
///
/// - verification errors from [`CodeSigningVerifier::verify_body`]
/// - [`Error::ManifestParse`] for malformed bodies, directives or filters
/// - [`Error::MismatchedManifestFilters`] if the manifest contradicts the
///   filters delivered with it
pub fn interpret_response(raw: RawManifestResponse, verifier: &CodeSigningVerifier) -> Result<RemoteCheck> {
    let manifest_filters = raw
        .manifest_filters
        .as_deref()
        .map(SelectionFilters::from_header)
        .transpose()?;

    let Some(body) = raw.body.filter(|b| !b.is_empty()) else {
        debug!("Update endpoint returned no content");
        return Ok(RemoteCheck {
            update: RemoteUpdate::NoUpdateAvailable,
            manifest_filters,
        });
    };

    let header_signature = raw
        .signature
        .as_deref()
        .map(ManifestSignature::from_header)
        .transpose()?;

    let (signed, signature) = match legacy_envelope(&body)? {
        Some((manifest_string, legacy_signature)) => {
            debug!("Unwrapping legacy signed manifest envelope");
            (manifest_string.into_bytes(), legacy_signature.or(header_signature))
        }
        None => (body.to_vec(), header_signature),
    };

    let verified = verifier.verify_body(&signed, signature)?;

    let value: Value = serde_json::from_slice(&verified.bytes)
        .map_err(|e| Error::ManifestParse(format!("invalid JSON: {e}")))?;

    if let Some(directive) = value.get("type").and_then(Value::as_str) {
        let update = parse_directive(directive, &value)?;
        info!("Update endpoint returned directive {directive}");
        return Ok(RemoteCheck {
            update,
            manifest_filters,
        });
    }

    let manifest = Manifest::from_json(&value)?.with_signature(verified.signature);

    if let Some(filters) = &manifest_filters {
        if !filters.matches(&manifest) {
            return Err(Error::MismatchedManifestFilters(format!(
                "manifest {} does not match the filters it was served with",
                manifest.id
            )));
        }
    }

    Ok(RemoteCheck {
        update: RemoteUpdate::Update(VerifiedManifest {
            manifest,
            is_verified: verified.is_verified,
        }),
        manifest_filters,
    })
}

/// `{"manifestString": "...", "signature": "..."}`, if the body is one.
fn legacy_envelope(body: &[u8]) -> Result<Option<(String, Option<ManifestSignature>)>> {
    let Ok(Value::Object(obj)) = serde_json::from_slice::<Value>(body) else {
        return Ok(None);
    };
    let Some(manifest_string) = obj.get("manifestString") else {
        return Ok(None);
    };
    let manifest_string = manifest_string
        .as_str()
        .ok_or_else(|| Error::ManifestParse("manifestString must be a string".to_string()))?
        .to_string();
    let signature = obj
        .get("signature")
        .and_then(Value::as_str)
        .map(ManifestSignature::from_legacy)
        .transpose()?;
    Ok(Some((manifest_string, signature)))
}

fn parse_directive(directive: &str, value: &Value) -> Result<RemoteUpdate> {
    match directive {
        DIRECTIVE_NO_UPDATE_AVAILABLE => Ok(RemoteUpdate::NoUpdateAvailable),
        DIRECTIVE_ROLL_BACK_TO_EMBEDDED => {
            let commit_time = value
                .pointer("/parameters/commitTime")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    Error::ManifestParse("rollBackToEmbedded directive has no commitTime".to_string())
                })?;
            let commit_time = DateTime::parse_from_rfc3339(commit_time)
                .map_err(|e| Error::ManifestParse(format!("invalid directive commitTime: {e}")))?
                .with_timezone(&Utc);
            Ok(RemoteUpdate::RollBackToEmbedded { commit_time })
        }
        other => Err(Error::ManifestParse(format!("unknown directive type: {other}"))),
    }
}
