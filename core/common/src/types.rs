//! Common types used throughout MQVault.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum length of a secret identifier, in bytes.
pub const MAX_SECRET_ID_LEN: usize = 256;

/// Unique identifier for a vault.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VaultId(String);

impl VaultId {
    /// Create a new VaultId from a string.
    ///
    /// # Errors
    /// - Returns error if id is empty
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(crate::Error::InvalidInput(
                "VaultId cannot be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Generate a random vault id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VaultId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Caller-assigned identifier of a stored secret.
///
/// Identifiers are bound into each record's authenticated data, so a
/// record moved to another id fails to open.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SecretId(String);

impl SecretId {
    /// Create a secret id.
    ///
    /// # Errors
    /// - Empty id
    /// - Longer than [`MAX_SECRET_ID_LEN`] bytes
    /// - Contains control characters
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Secret id cannot be empty".to_string(),
            ));
        }
        if id.len() > MAX_SECRET_ID_LEN {
            return Err(crate::Error::InvalidInput(format!(
                "Secret id exceeds {} bytes",
                MAX_SECRET_ID_LEN
            )));
        }
        if id.chars().any(char::is_control) {
            return Err(crate::Error::InvalidInput(
                "Secret id cannot contain control characters".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Generate a random id for callers that don't supply one.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl TryFrom<String> for SecretId {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::new(value)
    }
}

impl From<SecretId> for String {
    fn from(id: SecretId) -> Self {
        id.0
    }
}

impl fmt::Display for SecretId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
