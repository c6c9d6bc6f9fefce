//! The persisted form of a sealed secret.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use mqvault_common::{Error, Result, SecretId};

/// One sealed secret as stored by a backend.
///
/// The store treats every field as opaque. Only the vault engine knows how
/// `nonce`, `ciphertext`, and `tag` relate to each other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRecord {
    pub id: SecretId,
    /// Epoch of the data key that sealed this record.
    pub key_epoch: u32,
    #[serde(with = "mqvault_common::encoding::base64_bytes")]
    pub nonce: Vec<u8>,
    #[serde(with = "mqvault_common::encoding::base64_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "mqvault_common::encoding::base64_bytes")]
    pub tag: Vec<u8>,
    /// Revision counter, 1 on first write.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SecretRecord {
    /// Serialize to bytes for storage.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Serialization(e.to_string()))
    }
}

#[cfg(test)]
pub(crate) fn sample_record(id: &str, version: u64) -> SecretRecord {
    let now = Utc::now();
    SecretRecord {
        id: SecretId::new(id).unwrap(),
        key_epoch: 1,
        nonce: vec![1u8; 24],
        ciphertext: format!("ciphertext-of-{}-v{}", id, version).into_bytes(),
        tag: vec![2u8; 16],
        version,
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_serialization() {
        let record = sample_record("k1", 3);
        let bytes = record.to_bytes().unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains("\"id\":\"k1\""));
        assert!(text.contains("\"tag\":\"AgICAgICAgICAgICAgICAg==\""));

        let restored = SecretRecord::from_bytes(&bytes).unwrap();
        assert_eq!(restored, record);
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(matches!(
            SecretRecord::from_bytes(b"{not json"),
            Err(Error::Serialization(_))
        ));
    }
}
