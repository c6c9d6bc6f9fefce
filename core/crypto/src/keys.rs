//! Key types with secure memory handling.
//!
//! All key types automatically zeroize their memory on drop to prevent
//! sensitive data from persisting in memory.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::HashSet;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::aead::NONCE_SIZE;
use crate::nonce::NonceSequence;
use mqvault_common::{Error, Result};

/// Length of encryption keys in bytes (256-bit).
pub const KEY_LENGTH: usize = 32;

/// Length of the KDF salt in bytes.
pub const SALT_LENGTH: usize = 32;

/// Minimum accepted master secret length in bytes.
pub const MIN_SECRET_LENGTH: usize = 8;

/// Minimum number of distinct byte values in a master secret.
pub const MIN_DISTINCT_BYTES: usize = 4;

/// Caller-supplied master secret.
///
/// Lives only as long as the request that carries it and is zeroized on
/// drop. Never serialized.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterSecret(Vec<u8>);

impl MasterSecret {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self(secret.into())
    }

    /// Get the secret bytes.
    ///
    /// # Security
    /// The returned slice should be used immediately and not stored.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Reject secrets that are empty, too short, or trivially repetitive.
    ///
    /// # Errors
    /// - `WeakSecret` describing which threshold was missed
    pub fn check_strength(&self) -> Result<()> {
        if self.0.is_empty() {
            return Err(Error::WeakSecret("secret is empty".to_string()));
        }
        if self.0.len() < MIN_SECRET_LENGTH {
            return Err(Error::WeakSecret(format!(
                "secret must be at least {} bytes",
                MIN_SECRET_LENGTH
            )));
        }
        let distinct: HashSet<u8> = self.0.iter().copied().collect();
        if distinct.len() < MIN_DISTINCT_BYTES {
            return Err(Error::WeakSecret(format!(
                "secret must contain at least {} distinct characters",
                MIN_DISTINCT_BYTES
            )));
        }
        Ok(())
    }
}

impl From<&str> for MasterSecret {
    fn from(value: &str) -> Self {
        Self::new(value.as_bytes())
    }
}

impl From<String> for MasterSecret {
    fn from(value: String) -> Self {
        Self::new(value.into_bytes())
    }
}

impl fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MasterSecret([REDACTED])")
    }
}

/// Key derived from the master secret, used only to wrap data keys.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct WrappingKey {
    pub(crate) key: [u8; KEY_LENGTH],
}

impl WrappingKey {
    pub(crate) fn empty() -> Self {
        Self {
            key: [0u8; KEY_LENGTH],
        }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }
}

impl fmt::Debug for WrappingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WrappingKey([REDACTED])")
    }
}

/// Data encryption key (DEK) for one key epoch.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DataKey {
    key: [u8; KEY_LENGTH],
    epoch: u32,
}

impl DataKey {
    /// Generate a random data key for the given epoch.
    pub fn generate(epoch: u32) -> Self {
        let mut key = [0u8; KEY_LENGTH];
        rand::thread_rng().fill_bytes(&mut key);
        Self { key, epoch }
    }

    pub(crate) fn from_bytes(key: [u8; KEY_LENGTH], epoch: u32) -> Self {
        Self { key, epoch }
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }

    /// Derive the key that encrypts a single record.
    ///
    /// Uses blake2b over the data key, the epoch, and the record id, so
    /// every record is sealed under its own subkey.
    pub fn derive_record_key(&self, record_id: &[u8]) -> RecordKey {
        use blake2::digest::consts::U32;
        use blake2::{Blake2b, Digest};

        let mut hasher = Blake2b::<U32>::new();
        hasher.update(self.key);
        hasher.update(self.epoch.to_be_bytes());
        hasher.update((record_id.len() as u64).to_be_bytes());
        hasher.update(record_id);
        hasher.update(b"mqvault-record-key");

        let result = hasher.finalize();
        let mut derived = [0u8; KEY_LENGTH];
        derived.copy_from_slice(&result);
        RecordKey { key: derived }
    }
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DataKey(epoch={}, [REDACTED])", self.epoch)
    }
}

/// Per-record subkey derived from a [`DataKey`].
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct RecordKey {
    key: [u8; KEY_LENGTH],
}

impl RecordKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }
}

impl fmt::Debug for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordKey([REDACTED])")
    }
}

/// Every unwrapped data key of a vault plus the nonce sequence for the
/// active one.
///
/// Dropping the ring zeroizes all keys it holds.
pub struct KeyRing {
    active_epoch: u32,
    keys: BTreeMap<u32, DataKey>,
    nonces: NonceSequence,
}

impl KeyRing {
    /// Build a key ring.
    ///
    /// # Errors
    /// - `active_epoch` has no key in `keys`
    pub fn new(active_epoch: u32, keys: Vec<DataKey>) -> Result<Self> {
        let keys: BTreeMap<u32, DataKey> = keys.into_iter().map(|k| (k.epoch, k)).collect();
        if !keys.contains_key(&active_epoch) {
            return Err(Error::Crypto("Active key epoch missing".to_string()));
        }
        Ok(Self {
            active_epoch,
            keys,
            nonces: NonceSequence::new(),
        })
    }

    pub fn active_epoch(&self) -> u32 {
        self.active_epoch
    }

    /// The data key new records are sealed with.
    pub fn active(&self) -> &DataKey {
        // Presence of the active epoch is checked in `new`.
        &self.keys[&self.active_epoch]
    }

    /// Look up the key for an epoch, active or retired.
    pub fn get(&self, epoch: u32) -> Option<&DataKey> {
        self.keys.get(&epoch)
    }

    /// All epochs held by this ring, ascending.
    pub fn epochs(&self) -> impl Iterator<Item = u32> + '_ {
        self.keys.keys().copied()
    }

    /// Next unique nonce for the active key.
    pub fn next_nonce(&self) -> Result<[u8; NONCE_SIZE]> {
        self.nonces.next()
    }

    pub(crate) fn keys(&self) -> impl Iterator<Item = &DataKey> {
        self.keys.values()
    }
}

impl fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRing")
            .field("active_epoch", &self.active_epoch)
            .field("epochs", &self.keys.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Salt for key derivation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Salt(#[serde(with = "mqvault_common::encoding::base64_bytes")] pub [u8; SALT_LENGTH]);

impl Salt {
    /// Generate a random salt.
    pub fn generate() -> Self {
        let mut salt = [0u8; SALT_LENGTH];
        rand::thread_rng().fill_bytes(&mut salt);
        Self(salt)
    }

    /// Create from bytes.
    pub fn from_bytes(bytes: [u8; SALT_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Get the salt bytes.
    pub fn as_bytes(&self) -> &[u8; SALT_LENGTH] {
        &self.0
    }
}
