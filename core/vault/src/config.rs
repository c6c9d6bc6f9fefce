//! Vault header and session policy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use mqvault_common::{Error, Result, VaultId};
use mqvault_crypto::{KdfParams, WrappedKeySet};

/// Header format version written by this build.
pub const FORMAT_VERSION: u32 = 1;

/// Persisted vault header.
///
/// Holds everything needed to unlock the vault given the right master
/// secret, and nothing that helps without it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultHeader {
    pub format_version: u32,
    pub vault_id: VaultId,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    /// KDF parameters, salt, and wrapped data keys.
    #[serde(flatten)]
    pub wrapped: WrappedKeySet,
}

#[derive(Deserialize)]
struct VersionProbe {
    format_version: u32,
}

impl VaultHeader {
    /// Create a header for a freshly initialized vault.
    pub fn new(vault_id: VaultId, wrapped: WrappedKeySet) -> Self {
        let now = Utc::now();
        Self {
            format_version: FORMAT_VERSION,
            vault_id,
            created_at: now,
            modified_at: now,
            wrapped,
        }
    }

    /// Copy of this header with a replaced key set.
    pub fn with_keys(&self, wrapped: WrappedKeySet) -> Self {
        Self {
            modified_at: Utc::now(),
            wrapped,
            ..self.clone()
        }
    }

    /// Serialize to bytes for storage.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from bytes.
    ///
    /// The format version is checked before the rest of the header is
    /// interpreted.
    ///
    /// # Errors
    /// - `UnsupportedFormat` if the version is not [`FORMAT_VERSION`]
    /// - `Serialization` if the bytes are not a header
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let probe: VersionProbe =
            serde_json::from_slice(bytes).map_err(|e| Error::Serialization(e.to_string()))?;
        if probe.format_version != FORMAT_VERSION {
            return Err(Error::UnsupportedFormat(format!(
                "vault header version {} (supported: {})",
                probe.format_version, FORMAT_VERSION
            )));
        }
        serde_json::from_slice(bytes).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// Lock and rate-limit behavior of a session.
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    /// Inactivity before the vault locks itself. `None` disables autolock.
    pub idle_timeout: Option<Duration>,
    /// Failed unlocks tolerated before backoff applies. 0 disables it.
    pub max_failed_attempts: u32,
    /// Delay imposed at the threshold, doubled per further failure.
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Parameters for newly wrapped key sets.
    pub kdf: KdfParams,
}

impl SessionPolicy {
    /// How long unlocks are refused after `failures` consecutive failures.
    ///
    /// Returns `None` while below the threshold.
    pub fn backoff_after(&self, failures: u32) -> Option<Duration> {
        if self.max_failed_attempts == 0 || failures < self.max_failed_attempts {
            return None;
        }
        let exponent = (failures - self.max_failed_attempts).min(31);
        let delay = self.base_backoff.saturating_mul(1u32 << exponent);
        Some(delay.min(self.max_backoff))
    }
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            idle_timeout: Some(Duration::from_secs(300)),
            max_failed_attempts: 5,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
            kdf: KdfParams::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqvault_crypto::{KdfAlgorithm, Salt, WrappedKey};

    fn sample_header() -> VaultHeader {
        VaultHeader::new(
            VaultId::new("v1").unwrap(),
            WrappedKeySet {
                kdf: KdfParams {
                    algorithm: KdfAlgorithm::Argon2id,
                    memory_cost: 1024,
                    time_cost: 1,
                    parallelism: 1,
                },
                salt: Salt::from_bytes([7u8; 32]),
                active_epoch: 1,
                keys: vec![WrappedKey {
                    epoch: 1,
                    blob: vec![9u8; 72],
                }],
            },
        )
    }

    #[test]
    fn test_header_serialization() {
        let header = sample_header();
        let bytes = header.to_bytes().unwrap();

        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["format_version"], 1);
        assert_eq!(value["vault_id"], "v1");
        assert_eq!(value["active_epoch"], 1);
        assert_eq!(value["kdf"]["algorithm"], "argon2id");
        assert!(value["salt"].is_string());

        let restored = VaultHeader::from_bytes(&bytes).unwrap();
        assert_eq!(restored, header);
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut value = serde_json::to_value(sample_header()).unwrap();
        value["format_version"] = serde_json::json!(2);
        let bytes = serde_json::to_vec(&value).unwrap();

        assert!(matches!(
            VaultHeader::from_bytes(&bytes),
            Err(Error::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_unknown_version_checked_before_fields() {
        let bytes = br#"{"format_version": 9, "something": "else"}"#;
        assert!(matches!(
            VaultHeader::from_bytes(bytes),
            Err(Error::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_garbage_header() {
        assert!(matches!(
            VaultHeader::from_bytes(b"not json"),
            Err(Error::Serialization(_))
        ));
    }

    #[test]
    fn test_with_keys_keeps_identity() {
        let header = sample_header();
        let mut keys = header.wrapped.clone();
        keys.active_epoch = 2;

        let updated = header.with_keys(keys);
        assert_eq!(updated.vault_id, header.vault_id);
        assert_eq!(updated.created_at, header.created_at);
        assert_eq!(updated.wrapped.active_epoch, 2);
        assert!(updated.modified_at >= header.modified_at);
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = SessionPolicy {
            max_failed_attempts: 3,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
            ..SessionPolicy::default()
        };

        assert_eq!(policy.backoff_after(2), None);
        assert_eq!(policy.backoff_after(3), Some(Duration::from_secs(1)));
        assert_eq!(policy.backoff_after(4), Some(Duration::from_secs(2)));
        assert_eq!(policy.backoff_after(5), Some(Duration::from_secs(4)));
        assert_eq!(policy.backoff_after(7), Some(Duration::from_secs(10)));
        assert_eq!(policy.backoff_after(200), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_backoff_disabled() {
        let policy = SessionPolicy {
            max_failed_attempts: 0,
            ..SessionPolicy::default()
        };
        assert_eq!(policy.backoff_after(1000), None);
    }
}
