//! Common error types for MQVault.
//!
//! Error messages are shown to callers verbatim. They must never carry
//! secrets, plaintext, or key bytes.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Top-level error type for MQVault operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Master secret rejected by the strength check.
    #[error("Weak secret: {0}")]
    WeakSecret(String),

    /// The master secret did not authenticate the wrapped keys.
    ///
    /// Covers both a wrong secret and a corrupted wrap; the two are
    /// indistinguishable.
    #[error("Authentication failed")]
    Authentication,

    /// Operation requires an unlocked vault.
    #[error("Vault is locked")]
    Locked,

    /// Vault has already been initialized.
    #[error("Vault is already initialized")]
    AlreadyInitialized,

    /// Vault has not been initialized yet.
    #[error("Vault is not initialized")]
    NotInitialized,

    /// A stored record failed authentication.
    #[error("Integrity check failed for record '{0}'")]
    Integrity(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Persisted data uses a format this build cannot read.
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// A storage call did not finish within its time limit.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Unlock attempts are temporarily refused.
    #[error("Too many failed attempts, retry in {retry_after:?}")]
    TooManyAttempts { retry_after: Duration },

    /// Cryptographic operation failed.
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Storage operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    /// Stable machine-readable classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::WeakSecret(_) => ErrorKind::WeakSecret,
            Error::Authentication => ErrorKind::Authentication,
            Error::Locked => ErrorKind::Locked,
            Error::AlreadyInitialized => ErrorKind::AlreadyInitialized,
            Error::NotInitialized => ErrorKind::NotInitialized,
            Error::Integrity(_) => ErrorKind::Integrity,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::TooManyAttempts { .. } => ErrorKind::TooManyAttempts,
            Error::Crypto(_) => ErrorKind::Crypto,
            Error::Storage(_) | Error::Io(_) => ErrorKind::Storage,
            Error::Serialization(_) => ErrorKind::Serialization,
            Error::InvalidInput(_) => ErrorKind::InvalidInput,
        }
    }

    /// Whether a caller may reasonably retry the failed operation.
    ///
    /// Only storage timeouts qualify. Security-relevant failures never do.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

/// Error classification reported across the facade boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    WeakSecret,
    Authentication,
    Locked,
    AlreadyInitialized,
    NotInitialized,
    Integrity,
    NotFound,
    UnsupportedFormat,
    Timeout,
    TooManyAttempts,
    Crypto,
    Storage,
    Serialization,
    InvalidInput,
}

impl ErrorKind {
    /// Snake-case code used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::WeakSecret => "weak_secret",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Locked => "locked",
            ErrorKind::AlreadyInitialized => "already_initialized",
            ErrorKind::NotInitialized => "not_initialized",
            ErrorKind::Integrity => "integrity",
            ErrorKind::NotFound => "not_found",
            ErrorKind::UnsupportedFormat => "unsupported_format",
            ErrorKind::Timeout => "timeout",
            ErrorKind::TooManyAttempts => "too_many_attempts",
            ErrorKind::Crypto => "crypto",
            ErrorKind::Storage => "storage",
            ErrorKind::Serialization => "serialization",
            ErrorKind::InvalidInput => "invalid_input",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
