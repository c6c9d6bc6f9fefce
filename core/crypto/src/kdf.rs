//! Key derivation using Argon2id.
//!
//! Argon2id is a memory-hard password hashing function that provides
//! resistance to both GPU and time-memory trade-off attacks. The parameters
//! are persisted next to the wrapped keys, so a vault can move to stronger
//! settings on its next rewrap without breaking older headers.

use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};

use crate::keys::{MasterSecret, Salt, WrappingKey, KEY_LENGTH};
use mqvault_common::{Error, Result};

/// Upper bound on `memory_cost`, in KiB (4 GiB).
pub const MAX_MEMORY_COST: u32 = 4 * 1024 * 1024;

/// Upper bound on `time_cost`.
pub const MAX_TIME_COST: u32 = 64;

/// Upper bound on `parallelism`.
pub const MAX_PARALLELISM: u32 = 64;

/// Supported key derivation algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KdfAlgorithm {
    /// Argon2id, version 0x13.
    Argon2id,
}

/// Parameters for Argon2id key derivation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub algorithm: KdfAlgorithm,
    /// Memory cost in KiB (e.g., 65536 = 64 MiB).
    pub memory_cost: u32,
    /// Number of iterations.
    pub time_cost: u32,
    /// Degree of parallelism.
    pub parallelism: u32,
}

impl KdfParams {
    /// Create parameters suitable for interactive use.
    ///
    /// These parameters provide a balance between security and usability,
    /// targeting approximately 0.5-1 second of derivation time.
    pub fn interactive() -> Self {
        Self {
            algorithm: KdfAlgorithm::Argon2id,
            memory_cost: 65536, // 64 MiB
            time_cost: 3,
            parallelism: 4,
        }
    }

    /// Create parameters suitable for sensitive data.
    ///
    /// Higher security parameters that may take several seconds.
    pub fn sensitive() -> Self {
        Self {
            algorithm: KdfAlgorithm::Argon2id,
            memory_cost: 262144, // 256 MiB
            time_cost: 4,
            parallelism: 4,
        }
    }

    /// Create moderate parameters for constrained hosts.
    pub fn moderate() -> Self {
        Self {
            algorithm: KdfAlgorithm::Argon2id,
            memory_cost: 32768, // 32 MiB
            time_cost: 3,
            parallelism: 2,
        }
    }

    /// Resolve a named preset.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "interactive" => Some(Self::interactive()),
            "moderate" => Some(Self::moderate()),
            "sensitive" => Some(Self::sensitive()),
            _ => None,
        }
    }

    fn to_argon2(&self) -> Result<Argon2<'static>> {
        if self.memory_cost > MAX_MEMORY_COST
            || self.time_cost > MAX_TIME_COST
            || self.parallelism > MAX_PARALLELISM
        {
            return Err(Error::Crypto(
                "KDF parameters exceed supported limits".to_string(),
            ));
        }

        let params = Params::new(
            self.memory_cost,
            self.time_cost,
            self.parallelism,
            Some(KEY_LENGTH),
        )
        .map_err(|e| Error::Crypto(format!("Invalid KDF parameters: {}", e)))?;

        let algorithm = match self.algorithm {
            KdfAlgorithm::Argon2id => Algorithm::Argon2id,
        };
        Ok(Argon2::new(algorithm, Version::V0x13, params))
    }

    /// Check that the parameters are accepted by the KDF and within the
    /// supported limits.
    pub fn validate(&self) -> Result<()> {
        self.to_argon2().map(|_| ())
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::interactive()
    }
}

/// Derive the wrapping key from the master secret and salt.
///
/// # Errors
/// - `WeakSecret` if the secret is empty
/// - `Crypto` if the parameters are invalid
///
/// # Security
/// - The secret is not stored or logged
/// - The output buffer is the zeroizing key itself, no intermediate copy
pub fn derive_wrapping_key(
    secret: &MasterSecret,
    salt: &Salt,
    params: &KdfParams,
) -> Result<WrappingKey> {
    if secret.is_empty() {
        return Err(Error::WeakSecret("secret is empty".to_string()));
    }

    let argon2 = params.to_argon2()?;

    let mut key = WrappingKey::empty();
    argon2
        .hash_password_into(secret.as_bytes(), salt.as_bytes(), &mut key.key)
        .map_err(|e| Error::Crypto(format!("Key derivation failed: {}", e)))?;

    Ok(key)
}

#[cfg(test)]
pub(crate) fn fast_params() -> KdfParams {
    KdfParams {
        algorithm: KdfAlgorithm::Argon2id,
        memory_cost: 1024,
        time_cost: 1,
        parallelism: 1,
    }
}
