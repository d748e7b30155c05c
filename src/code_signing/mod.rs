//! Code-signing verification for update manifests.
//!
//! Manifests (and directives) are signed by the update server with an RSA
//! key using PKCS#1 v1.5 over SHA-256. The signature travels either in the
//! `expo-signature` response header or, for legacy responses, in a JSON
//! envelope next to the manifest string. Verification always runs before
//! the manifest is parsed into a trusted update.

mod cache;

pub use cache::VerifiedCache;

use crate::error::{Error, Result};
use crate::headers::{parse_dictionary, serialize_string_dictionary};
use crate::manifest::Manifest;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::DecodePublicKey;
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use tracing::{debug, warn};

/// Wire identifier for RSA PKCS#1 v1.5 with SHA-256.
pub const ALGORITHM_RSA_SHA256: &str = "rsa-v1_5-sha256";

/// Key identifier assumed when a signature header does not carry one.
pub const DEFAULT_KEY_ID: &str = "root";

/// Response header carrying the signature.
pub const SIGNATURE_HEADER: &str = "expo-signature";

/// Request header advertising the expected signature shape.
pub const EXPECT_SIGNATURE_HEADER: &str = "expo-expect-signature";

/// Code-signing algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Algorithm {
    /// RSA PKCS#1 v1.5 signature over a SHA-256 digest.
    #[default]
    RsaSha256,
}

impl Algorithm {
    /// Wire identifier.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RsaSha256 => ALGORITHM_RSA_SHA256,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolve an algorithm identifier.
///
/// An absent identifier means RSA-SHA256: manifests signed before the
/// field existed omit it. A present but unknown identifier is rejected.
///
/// # Errors
///
/// Returns [`Error::AlgorithmParse`] for any unrecognised identifier.
pub fn parse_algorithm(value: Option<&str>) -> Result<Algorithm> {
    match value {
        None => Ok(Algorithm::RsaSha256),
        Some(ALGORITHM_RSA_SHA256) => Ok(Algorithm::RsaSha256),
        Some(other) => Err(Error::AlgorithmParse(format!(
            "unrecognized code signing algorithm: {other}"
        ))),
    }
}

/// Signature delivered with a manifest or directive.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestSignature {
    /// Raw signature bytes.
    pub bytes: Vec<u8>,
    /// Algorithm the signature was produced with.
    pub algorithm: Algorithm,
    /// Signing key identifier. `None` for legacy envelopes.
    pub key_id: Option<String>,
}

impl fmt::Debug for ManifestSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManifestSignature")
            .field("len", &self.bytes.len())
            .field("algorithm", &self.algorithm)
            .field("key_id", &self.key_id)
            .finish()
    }
}

impl ManifestSignature {
    /// Parse an `expo-signature` header value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSignature`] if the header is malformed or
    /// has no `sig` member, and [`Error::AlgorithmParse`] if `alg` names
    /// an unknown algorithm.
    pub fn from_header(header: &str) -> Result<Self> {
        let dict = parse_dictionary(header)
            .map_err(|e| Error::InvalidSignature(format!("signature header: {e}")))?;

        let sig = dict
            .get("sig")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::InvalidSignature("no sig in signature header".to_string()))?;
        let bytes = STANDARD
            .decode(sig)
            .map_err(|e| Error::InvalidSignature(format!("sig is not base64: {e}")))?;

        let algorithm = parse_algorithm(dict.get("alg").and_then(|v| v.as_str()))?;
        let key_id = dict
            .get("keyid")
            .and_then(|v| v.as_str())
            .unwrap_or(DEFAULT_KEY_ID)
            .to_string();

        Ok(Self {
            bytes,
            algorithm,
            key_id: Some(key_id),
        })
    }

    /// Signature from a legacy JSON envelope's base64 `signature` field.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSignature`] if the value is not base64.
    pub fn from_legacy(encoded: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| Error::InvalidSignature(format!("signature is not base64: {e}")))?;
        Ok(Self {
            bytes,
            algorithm: Algorithm::RsaSha256,
            key_id: None,
        })
    }

    /// Render as an `expo-signature` header value.
    #[must_use]
    pub fn to_header(&self) -> String {
        let sig = STANDARD.encode(&self.bytes);
        let key_id = self.key_id.as_deref().unwrap_or(DEFAULT_KEY_ID);
        serialize_string_dictionary([
            ("sig", sig.as_str()),
            ("keyid", key_id),
            ("alg", self.algorithm.as_str()),
        ])
    }
}

/// Code-signing configuration, loaded once at process start.
#[derive(Clone)]
pub struct SigningConfig {
    algorithm: Algorithm,
    key_id: String,
    public_key: RsaPublicKey,
}

impl fmt::Debug for SigningConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningConfig")
            .field("algorithm", &self.algorithm)
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl SigningConfig {
    /// Create a configuration from a parsed public key.
    #[must_use]
    pub fn new(algorithm: Algorithm, key_id: impl Into<String>, public_key: RsaPublicKey) -> Self {
        Self {
            algorithm,
            key_id: key_id.into(),
            public_key,
        }
    }

    /// Create a configuration from a PEM-encoded RSA public key.
    ///
    /// Both SubjectPublicKeyInfo (`BEGIN PUBLIC KEY`) and PKCS#1
    /// (`BEGIN RSA PUBLIC KEY`) encodings are accepted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlgorithmParse`] for an unknown algorithm and
    /// [`Error::Config`] if the key cannot be decoded.
    pub fn from_pem(pem: &str, key_id: Option<&str>, algorithm: Option<&str>) -> Result<Self> {
        let algorithm = parse_algorithm(algorithm)?;
        let public_key = RsaPublicKey::from_public_key_pem(pem)
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
            .map_err(|e| Error::Config(format!("invalid code signing public key: {e}")))?;
        Ok(Self::new(
            algorithm,
            key_id.unwrap_or(DEFAULT_KEY_ID),
            public_key,
        ))
    }

    /// Load a PEM public key from disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or decoded.
    pub fn from_pem_file(path: &Path, key_id: Option<&str>, algorithm: Option<&str>) -> Result<Self> {
        let pem = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "failed to read code signing key '{}': {e}",
                path.display()
            ))
        })?;
        Self::from_pem(&pem, key_id, algorithm)
    }

    /// Configured algorithm.
    #[must_use]
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Configured key identifier.
    #[must_use]
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Value for the `expo-expect-signature` request header.
    #[must_use]
    pub fn expect_signature_header(&self) -> String {
        format!(
            "sig, keyid=\"{}\", alg=\"{}\"",
            self.key_id,
            self.algorithm.as_str()
        )
    }
}

/// Verify `body` against `signature` using `config`.
///
/// # Errors
///
/// - [`Error::InvalidSignature`] if no signature was supplied or it does
///   not verify
/// - [`Error::KeyMismatch`] if the signature names a different key
/// - [`Error::UnsupportedAlgorithm`] if the signature algorithm differs
///   from the configured one
pub fn verify(body: &[u8], signature: Option<&ManifestSignature>, config: &SigningConfig) -> Result<()> {
    let signature = signature.ok_or_else(|| {
        Error::InvalidSignature(format!("no {SIGNATURE_HEADER} supplied for signed update"))
    })?;

    if signature.algorithm != config.algorithm {
        return Err(Error::UnsupportedAlgorithm(format!(
            "signature uses {}, configured for {}",
            signature.algorithm, config.algorithm
        )));
    }

    if let Some(key_id) = &signature.key_id {
        if key_id != &config.key_id {
            return Err(Error::KeyMismatch {
                expected: config.key_id.clone(),
                actual: key_id.clone(),
            });
        }
    }

    match config.algorithm {
        Algorithm::RsaSha256 => {
            let sig = Signature::try_from(signature.bytes.as_slice())
                .map_err(|e| Error::InvalidSignature(format!("malformed signature: {e}")))?;
            VerifyingKey::<Sha256>::new(config.public_key.clone())
                .verify(body, &sig)
                .map_err(|_| {
                    Error::InvalidSignature(
                        "manifest download was successful, but signature was incorrect"
                            .to_string(),
                    )
                })
        }
    }
}

/// Sign `body` with an RSA private key.
///
/// Used by release tooling and tests; the client only verifies.
///
/// # Errors
///
/// Returns [`Error::InvalidSignature`] if signing fails.
pub fn sign(body: &[u8], private_key: &RsaPrivateKey, key_id: &str) -> Result<ManifestSignature> {
    let signature = SigningKey::<Sha256>::new(private_key.clone())
        .try_sign(body)
        .map_err(|e| Error::InvalidSignature(format!("signing failed: {e}")))?;
    Ok(ManifestSignature {
        bytes: signature.to_vec(),
        algorithm: Algorithm::RsaSha256,
        key_id: Some(key_id.to_string()),
    })
}

/// Body that passed code-signing checks (or was accepted unsigned).
#[derive(Debug, Clone)]
pub struct VerifiedBody {
    /// Bytes that were signed.
    pub bytes: Vec<u8>,
    /// Signature the body was delivered with.
    pub signature: Option<ManifestSignature>,
    /// Whether a signature was actually checked.
    pub is_verified: bool,
}

/// Manifest parsed from a [`VerifiedBody`].
#[derive(Debug, Clone)]
pub struct VerifiedManifest {
    /// The manifest, with its signature attached.
    pub manifest: Manifest,
    /// Whether a signature was actually checked.
    pub is_verified: bool,
}

/// Verifier combining the signing configuration and a result cache.
#[derive(Clone)]
pub struct CodeSigningVerifier {
    config: Option<SigningConfig>,
    cache: VerifiedCache,
}

impl CodeSigningVerifier {
    /// Create a verifier. `None` accepts unsigned responses.
    #[must_use]
    pub fn new(config: Option<SigningConfig>) -> Self {
        Self {
            config,
            cache: VerifiedCache::new(),
        }
    }

    /// Signing configuration, if code signing is enabled.
    #[must_use]
    pub fn config(&self) -> Option<&SigningConfig> {
        self.config.as_ref()
    }

    /// Verifications answered from the cache.
    #[must_use]
    pub fn cache_hits(&self) -> u64 {
        self.cache.hits()
    }

    /// Number of signatures remembered as verified.
    #[must_use]
    pub fn cached_signatures(&self) -> usize {
        self.cache.len()
    }

    /// Verify a body's signature.
    ///
    /// # Errors
    ///
    /// See [`verify`].
    pub fn verify_body(&self, body: &[u8], signature: Option<ManifestSignature>) -> Result<VerifiedBody> {
        let Some(config) = &self.config else {
            debug!("Code signing not configured, accepting unsigned body");
            return Ok(VerifiedBody {
                bytes: body.to_vec(),
                signature,
                is_verified: false,
            });
        };

        let cache_key = signature
            .as_ref()
            .map(|sig| cache_key(config.key_id(), body, &sig.bytes));

        if let Some(key) = &cache_key {
            if self.cache.is_verified(key) {
                debug!("Signature already verified, skipping RSA check");
                return Ok(VerifiedBody {
                    bytes: body.to_vec(),
                    signature,
                    is_verified: true,
                });
            }
        }

        if let Err(e) = verify(body, signature.as_ref(), config) {
            warn!("Code signing verification failed: {e}");
            return Err(e);
        }

        if let Some(key) = cache_key {
            self.cache.record(key);
        }
        debug!("Update code signature verified successfully");

        Ok(VerifiedBody {
            bytes: body.to_vec(),
            signature,
            is_verified: true,
        })
    }

    /// Verify and parse a manifest.
    ///
    /// # Errors
    ///
    /// Returns verification errors from [`verify`], or
    /// [`Error::ManifestParse`] if the verified body is not a manifest.
    pub fn verify_manifest(&self, body: &[u8], signature: Option<ManifestSignature>) -> Result<VerifiedManifest> {
        let verified = self.verify_body(body, signature)?;
        let manifest = Manifest::parse(&verified.bytes)?.with_signature(verified.signature);
        Ok(VerifiedManifest {
            manifest,
            is_verified: verified.is_verified,
        })
    }
}

fn cache_key(key_id: &str, body: &[u8], signature: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(key_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(body);
    hasher.update(signature);
    hasher.finalize().into()
}
