//! Error types for expo-updates.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the updates core.
#[derive(Debug, Error)]
pub enum Error {
    /// Manifest JSON is malformed or misses a required field.
    #[error("Manifest parse error: {0}")]
    ManifestParse(String),

    /// Code-signing algorithm string is not recognised.
    #[error("Algorithm parse error: {0}")]
    AlgorithmParse(String),

    /// Algorithm is recognised but cannot be used with the configured key.
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Signature is missing, malformed or does not verify.
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    /// Signature was produced by a key other than the configured one.
    #[error("Key mismatch: expected key id {expected}, got {actual}")]
    KeyMismatch {
        /// Configured key identifier.
        expected: String,
        /// Key identifier carried by the signature.
        actual: String,
    },

    /// Manifest content contradicts the filters delivered with it.
    #[error("Manifest filters mismatch: {0}")]
    MismatchedManifestFilters(String),

    /// Downloaded asset content does not match its declared hash.
    #[error("Hash mismatch for asset {key}: expected {expected}, got {actual}")]
    HashMismatch {
        /// Asset key.
        key: String,
        /// Declared hash (hex).
        expected: String,
        /// Computed hash (hex).
        actual: String,
    },

    /// Persistence failure; partial writes have been rolled back.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Requested update does not exist in the store.
    #[error("Update not found: {0}")]
    NotFound(String),

    /// Update is known to have failed on this device and will not be
    /// loaded again.
    #[error("Update rejected: {0}")]
    RejectedUpdate(String),

    /// Operation is not legal in the current state machine state.
    #[error("Invalid state transition: cannot {operation} while {from}")]
    InvalidStateTransition {
        /// State the machine was in.
        from: String,
        /// Operation that was attempted.
        operation: String,
    },

    /// Transient network failure.
    #[error("Network error: {0}")]
    Network(String),

    /// Operation was cancelled cooperatively.
    #[error("Operation cancelled")]
    Cancelled,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Host launcher failure.
    #[error("Host error: {0}")]
    Host(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Serializable classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// See [`Error::ManifestParse`].
    ManifestParse,
    /// See [`Error::AlgorithmParse`].
    AlgorithmParse,
    /// See [`Error::UnsupportedAlgorithm`].
    UnsupportedAlgorithm,
    /// See [`Error::InvalidSignature`].
    InvalidSignature,
    /// See [`Error::KeyMismatch`].
    KeyMismatch,
    /// See [`Error::MismatchedManifestFilters`].
    MismatchedManifestFilters,
    /// See [`Error::HashMismatch`].
    HashMismatch,
    /// See [`Error::Storage`] and [`Error::Io`].
    Storage,
    /// See [`Error::NotFound`].
    NotFound,
    /// See [`Error::RejectedUpdate`].
    RejectedUpdate,
    /// See [`Error::InvalidStateTransition`].
    InvalidStateTransition,
    /// See [`Error::Network`].
    Network,
    /// See [`Error::Cancelled`].
    Cancelled,
    /// See [`Error::Config`].
    Config,
    /// See [`Error::Host`].
    Host,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ManifestParse => "ManifestParseError",
            Self::AlgorithmParse => "AlgorithmParseError",
            Self::UnsupportedAlgorithm => "UnsupportedAlgorithm",
            Self::InvalidSignature => "InvalidSignature",
            Self::KeyMismatch => "KeyMismatch",
            Self::MismatchedManifestFilters => "MismatchedManifestFilters",
            Self::HashMismatch => "HashMismatch",
            Self::Storage => "StorageError",
            Self::NotFound => "NotFound",
            Self::RejectedUpdate => "RejectedUpdate",
            Self::InvalidStateTransition => "InvalidStateTransition",
            Self::Network => "NetworkError",
            Self::Cancelled => "Cancelled",
            Self::Config => "ConfigError",
            Self::Host => "HostError",
        };
        f.write_str(name)
    }
}

impl Error {
    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ManifestParse(_) => ErrorKind::ManifestParse,
            Self::AlgorithmParse(_) => ErrorKind::AlgorithmParse,
            Self::UnsupportedAlgorithm(_) => ErrorKind::UnsupportedAlgorithm,
            Self::InvalidSignature(_) => ErrorKind::InvalidSignature,
            Self::KeyMismatch { .. } => ErrorKind::KeyMismatch,
            Self::MismatchedManifestFilters(_) => ErrorKind::MismatchedManifestFilters,
            Self::HashMismatch { .. } => ErrorKind::HashMismatch,
            Self::Storage(_) | Self::Io(_) => ErrorKind::Storage,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::RejectedUpdate(_) => ErrorKind::RejectedUpdate,
            Self::InvalidStateTransition { .. } => ErrorKind::InvalidStateTransition,
            Self::Network(_) => ErrorKind::Network,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Config(_) => ErrorKind::Config,
            Self::Host(_) => ErrorKind::Host,
        }
    }

    /// Whether this error fails a single update candidate's verification.
    #[must_use]
    pub fn is_verification_failure(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::AlgorithmParse
                | ErrorKind::UnsupportedAlgorithm
                | ErrorKind::InvalidSignature
                | ErrorKind::KeyMismatch
        )
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::Network(e.to_string())
    }
}
