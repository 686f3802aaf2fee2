//! Error types for dataset-fetch
//!
//! This module provides:
//! - The crate-wide [`Error`] enum, with context on every variant (provider, URL, path)
//! - [`FailureKind`], the coarse classification reported in per-dataset outcomes
//!
//! Only [`Error::SelectionTooLarge`] (and configuration/catalog failures) abort a whole
//! download call; everything else is folded into the outcome of a single dataset.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for dataset-fetch operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for dataset-fetch
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "token_url")
        key: Option<String>,
    },

    /// The external catalog could not resolve a selection
    #[error("catalog error: {0}")]
    Catalog(String),

    /// The selection resolved to more datasets than the safety limit allows
    #[error("selection matches {found} datasets, more than the limit of {limit}")]
    SelectionTooLarge {
        /// Number of datasets the selection resolved to
        found: usize,
        /// The configured safety limit
        limit: usize,
    },

    /// Credentials could not be obtained or were rejected after a refresh
    #[error("authentication failed for {provider}: {reason}")]
    AuthenticationFailed {
        /// URL prefix of the provider
        provider: String,
        /// Why authentication failed
        reason: String,
    },

    /// The remote side rejected the credentials of a single request
    #[error("{url} rejected the credentials ({status})")]
    Unauthorized {
        /// The URL that was requested
        url: String,
        /// Protocol status (e.g. "401 Unauthorized", "530")
        status: String,
    },

    /// No download slot became free before the acquisition timeout
    #[error("no download slot available for {provider} after {waited:?}")]
    SlotUnavailable {
        /// Provider key the slot was requested for
        provider: String,
        /// How long the acquisition waited
        waited: Duration,
    },

    /// A transfer kept failing with retryable errors until attempts ran out
    #[error("transfer from {url} failed after {attempts} attempts: {reason}")]
    TransferFailed {
        /// The URL being transferred
        url: String,
        /// Number of attempts made
        attempts: u32,
        /// The last error seen
        reason: String,
    },

    /// The destination could not be written
    #[error("cannot write to {path}: {source}")]
    DestinationUnwritable {
        /// The path that could not be written
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The source could not be read while it was being transferred
    #[error("cannot read from {url}: {source}")]
    SourceRead {
        /// The URL or path being read
        url: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The URL no longer points to a downloadable file
    #[error("{url} is not downloadable ({reason})")]
    ObsoleteUrl {
        /// The obsolete URL
        url: String,
        /// Reason reported by the provider (e.g. "404: URL does not exist")
        reason: String,
    },

    /// The URI could not be parsed or used
    #[error("invalid URI {uri}: {reason}")]
    InvalidUri {
        /// The offending URI
        uri: String,
        /// Why it is invalid
        reason: String,
    },

    /// No transport handles the URI scheme
    #[error("unsupported URI scheme: {0}")]
    UnsupportedScheme(String),

    /// HTTP request completed with an error status
    #[error("HTTP {status} from {url}")]
    HttpStatus {
        /// The requested URL
        url: String,
        /// HTTP status code
        status: u16,
    },

    /// The response body was shorter than announced
    #[error("transfer from {url} truncated: got {received} of {expected} bytes")]
    Truncated {
        /// The requested URL
        url: String,
        /// Bytes actually received
        received: u64,
        /// Bytes announced by the provider
        expected: u64,
    },

    /// The provider answered with an empty file
    #[error("empty file received from {0}")]
    EmptyTransfer(String),

    /// No file name could be determined for the transfer
    #[error("could not determine a file name for {0}")]
    FileNameUnknown(String),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// FTP connection error
    #[error("FTP error: {0}")]
    Ftp(String),

    /// The FTP server answered a command with an unexpected reply
    #[error("FTP reply {code}: {message}")]
    FtpReply {
        /// Numeric reply code (RFC 959)
        code: u32,
        /// Reply text
        message: String,
    },

    /// Shared store (Redis) error
    #[error("store error: {0}")]
    Store(String),

    /// One-time password generation error
    #[error("TOTP error: {0}")]
    Totp(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yml::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a configuration error for a specific key
    pub fn config(message: impl Into<String>, key: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.into()),
        }
    }

    /// Coarse classification used in per-dataset outcomes
    pub fn kind(&self) -> FailureKind {
        match self {
            Error::SelectionTooLarge { .. } => FailureKind::SelectionTooLarge,
            Error::AuthenticationFailed { .. } | Error::Unauthorized { .. } | Error::Totp(_) => {
                FailureKind::AuthenticationFailed
            }
            Error::SlotUnavailable { .. } => FailureKind::SlotUnavailable,
            Error::DestinationUnwritable { .. } => FailureKind::DestinationUnwritable,
            Error::ObsoleteUrl { .. } => FailureKind::ObsoleteUrl,
            Error::InvalidUri { .. } | Error::UnsupportedScheme(_) => FailureKind::InvalidUri,
            Error::Store(_) => FailureKind::Store,
            Error::TransferFailed { .. }
            | Error::HttpStatus { .. }
            | Error::Truncated { .. }
            | Error::EmptyTransfer(_)
            | Error::FileNameUnknown(_)
            | Error::SourceRead { .. }
            | Error::Network(_)
            | Error::Ftp(_)
            | Error::FtpReply { .. } => FailureKind::TransferFailed,
            Error::Io(_) => FailureKind::DestinationUnwritable,
            Error::Config { .. }
            | Error::Catalog(_)
            | Error::Serialization(_)
            | Error::Yaml(_)
            | Error::Other(_) => FailureKind::Other,
        }
    }

    /// True when this error means the remote side refused the credentials
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self, Error::Unauthorized { .. })
    }
}

/// Failure classification reported per dataset
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Pre-flight safety limit exceeded (whole call)
    SelectionTooLarge,
    /// Credentials missing or rejected after one refresh
    AuthenticationFailed,
    /// Timed out waiting for a provider download slot
    SlotUnavailable,
    /// Retryable transfer errors exhausted, or terminal transfer error
    TransferFailed,
    /// Destination directory or file not writable
    DestinationUnwritable,
    /// The URL no longer serves the dataset
    ObsoleteUrl,
    /// Malformed or unsupported URI
    InvalidUri,
    /// The shared store failed
    Store,
    /// Anything else
    Other,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::SelectionTooLarge => "selection_too_large",
            FailureKind::AuthenticationFailed => "authentication_failed",
            FailureKind::SlotUnavailable => "slot_unavailable",
            FailureKind::TransferFailed => "transfer_failed",
            FailureKind::DestinationUnwritable => "destination_unwritable",
            FailureKind::ObsoleteUrl => "obsolete_url",
            FailureKind::InvalidUri => "invalid_uri",
            FailureKind::Store => "store",
            FailureKind::Other => "other",
        };
        f.write_str(s)
    }
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Error::Store(e.to_string())
    }
}

impl From<suppaftp::FtpError> for Error {
    fn from(e: suppaftp::FtpError) -> Self {
        match e {
            suppaftp::FtpError::UnexpectedResponse(response) => Error::FtpReply {
                code: response.status.code(),
                message: String::from_utf8_lossy(&response.body).trim().to_string(),
            },
            other => Error::Ftp(other.to_string()),
        }
    }
}
