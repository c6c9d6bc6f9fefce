//! Data key wrapping under the master secret.
//!
//! The wrapped set is everything needed to recover the data keys given the
//! right master secret: salt, KDF parameters, and every data key sealed
//! under the derived wrapping key. It is safe to persist.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::aead::{decrypt, encrypt, NONCE_SIZE, TAG_SIZE};
use crate::kdf::{derive_wrapping_key, KdfParams};
use crate::keys::{DataKey, KeyRing, MasterSecret, Salt, WrappingKey, KEY_LENGTH};
use mqvault_common::{Error, Result, VaultId};

const WRAP_AAD_DOMAIN: &[u8] = b"mqvault/wrap/v1";

/// A data key sealed under the wrapping key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    pub epoch: u32,
    /// `nonce || ciphertext || tag`.
    #[serde(with = "mqvault_common::encoding::base64_bytes")]
    pub blob: Vec<u8>,
}

/// All wrapped data keys of a vault with their derivation inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKeySet {
    pub kdf: KdfParams,
    pub salt: Salt,
    pub active_epoch: u32,
    pub keys: Vec<WrappedKey>,
}

fn wrap_aad(vault_id: &VaultId, epoch: u32) -> Vec<u8> {
    let id = vault_id.as_str().as_bytes();
    let mut aad = Vec::with_capacity(WRAP_AAD_DOMAIN.len() + 12 + id.len());
    aad.extend_from_slice(WRAP_AAD_DOMAIN);
    aad.extend_from_slice(&(id.len() as u64).to_be_bytes());
    aad.extend_from_slice(id);
    aad.extend_from_slice(&epoch.to_be_bytes());
    aad
}

fn seal_keys<'a>(
    wrapping_key: &WrappingKey,
    keys: impl Iterator<Item = &'a DataKey>,
    vault_id: &VaultId,
) -> Result<Vec<WrappedKey>> {
    keys.map(|key| {
        let blob = encrypt(
            wrapping_key.as_bytes(),
            &wrap_aad(vault_id, key.epoch()),
            key.as_bytes(),
        )?;
        Ok(WrappedKey {
            epoch: key.epoch(),
            blob,
        })
    })
    .collect()
}

fn wrap_ring(
    secret: &MasterSecret,
    params: &KdfParams,
    ring: &KeyRing,
    vault_id: &VaultId,
) -> Result<WrappedKeySet> {
    let salt = Salt::generate();
    let wrapping_key = derive_wrapping_key(secret, &salt, params)?;
    let keys = seal_keys(&wrapping_key, ring.keys(), vault_id)?;

    Ok(WrappedKeySet {
        kdf: params.clone(),
        salt,
        active_epoch: ring.active_epoch(),
        keys,
    })
}

/// Create the first data key of a vault and wrap it under `secret`.
///
/// # Errors
/// - `WeakSecret` if the secret fails the strength check
/// - `Crypto` if the KDF parameters are invalid
pub fn initialize(
    secret: &MasterSecret,
    params: &KdfParams,
    vault_id: &VaultId,
) -> Result<WrappedKeySet> {
    secret.check_strength()?;
    params.validate()?;

    let ring = KeyRing::new(1, vec![DataKey::generate(1)])?;
    let set = wrap_ring(secret, params, &ring, vault_id)?;

    debug!(vault_id = %vault_id, "Generated and wrapped initial data key");
    Ok(set)
}

/// Recover every data key in `set`.
///
/// # Errors
/// - `Authentication` if any key fails to unwrap. A wrong secret, a
///   corrupted blob and out-of-range stored KDF parameters all produce
///   the same error.
pub fn unwrap(secret: &MasterSecret, set: &WrappedKeySet, vault_id: &VaultId) -> Result<KeyRing> {
    if secret.is_empty() {
        return Err(Error::Authentication);
    }
    // Stored parameters are unauthenticated; check them before allocating.
    set.kdf.validate().map_err(|_| Error::Authentication)?;

    let wrapping_key = derive_wrapping_key(secret, &set.salt, &set.kdf)?;

    let mut keys = Vec::with_capacity(set.keys.len());
    for wrapped in &set.keys {
        if wrapped.blob.len() != NONCE_SIZE + KEY_LENGTH + TAG_SIZE {
            return Err(Error::Authentication);
        }
        let plain = decrypt(
            wrapping_key.as_bytes(),
            &wrap_aad(vault_id, wrapped.epoch),
            &wrapped.blob,
        )
        .map_err(|_| Error::Authentication)?;

        let mut bytes = [0u8; KEY_LENGTH];
        bytes.copy_from_slice(&plain);
        let key = DataKey::from_bytes(bytes, wrapped.epoch);
        zeroize::Zeroize::zeroize(&mut bytes);
        keys.push(key);
    }

    KeyRing::new(set.active_epoch, keys).map_err(|_| Error::Authentication)
}

/// Re-protect the same data keys under a new secret.
///
/// A fresh salt is drawn and `new_params` replace the stored KDF
/// parameters. Record ciphertexts are unaffected.
///
/// # Errors
/// - `Authentication` if `old` does not unwrap the set
/// - `WeakSecret` if `new` fails the strength check
pub fn rewrap(
    old: &MasterSecret,
    new: &MasterSecret,
    set: &WrappedKeySet,
    new_params: &KdfParams,
    vault_id: &VaultId,
) -> Result<WrappedKeySet> {
    let ring = unwrap(old, set, vault_id)?;
    new.check_strength()?;
    new_params.validate()?;

    let rewrapped = wrap_ring(new, new_params, &ring, vault_id)?;
    debug!(vault_id = %vault_id, keys = rewrapped.keys.len(), "Rewrapped data keys");
    Ok(rewrapped)
}

/// Add a new active data key at the next epoch.
///
/// Existing keys stay in the set as retired keys so records sealed under
/// them remain readable until rotated.
///
/// # Errors
/// - `Authentication` if `secret` does not unwrap the set
pub fn add_epoch(
    secret: &MasterSecret,
    set: &WrappedKeySet,
    vault_id: &VaultId,
) -> Result<(WrappedKeySet, KeyRing)> {
    let ring = unwrap(secret, set, vault_id)?;

    let next_epoch = ring
        .epochs()
        .max()
        .and_then(|e| e.checked_add(1))
        .ok_or_else(|| Error::Crypto("Key epoch overflow".to_string()))?;

    let mut keys: Vec<DataKey> = ring.keys().cloned().collect();
    keys.push(DataKey::generate(next_epoch));
    let rotated = KeyRing::new(next_epoch, keys)?;

    let wrapped = wrap_ring(secret, &set.kdf, &rotated, vault_id)?;
    debug!(vault_id = %vault_id, epoch = next_epoch, "Added data key epoch");
    Ok((wrapped, rotated))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kdf::fast_params;

    const SECRET: &str = "correct-horse-battery-staple";

    fn vault() -> VaultId {
        VaultId::new("vault-under-test").unwrap()
    }

    #[test]
    fn test_initialize_and_unwrap() {
        let secret = MasterSecret::from(SECRET);
        let set = initialize(&secret, &fast_params(), &vault()).unwrap();

        assert_eq!(set.active_epoch, 1);
        assert_eq!(set.keys.len(), 1);

        let ring = unwrap(&secret, &set, &vault()).unwrap();
        assert_eq!(ring.active_epoch(), 1);
    }

    #[test]
    fn test_unwrap_is_stable() {
        let secret = MasterSecret::from(SECRET);
        let set = initialize(&secret, &fast_params(), &vault()).unwrap();

        let a = unwrap(&secret, &set, &vault()).unwrap();
        let b = unwrap(&secret, &set, &vault()).unwrap();
        assert_eq!(a.active().as_bytes(), b.active().as_bytes());
    }

    #[test]
    fn test_weak_secret_rejected() {
        let result = initialize(&"short".into(), &fast_params(), &vault());
        assert!(matches!(result, Err(Error::WeakSecret(_))));

        let result = initialize(&"".into(), &fast_params(), &vault());
        assert!(matches!(result, Err(Error::WeakSecret(_))));
    }

    #[test]
    fn test_wrong_secret_and_corruption_look_the_same() {
        let secret = MasterSecret::from(SECRET);
        let set = initialize(&secret, &fast_params(), &vault()).unwrap();

        let wrong = unwrap(&"not-the-right-secret".into(), &set, &vault());
        assert!(matches!(wrong, Err(Error::Authentication)));

        let mut corrupted = set.clone();
        corrupted.keys[0].blob[NONCE_SIZE + 1] ^= 0x01;
        let result = unwrap(&secret, &corrupted, &vault());
        assert!(matches!(result, Err(Error::Authentication)));

        let mut truncated = set.clone();
        truncated.keys[0].blob.pop();
        assert!(matches!(
            unwrap(&secret, &truncated, &vault()),
            Err(Error::Authentication)
        ));
    }

    #[test]
    fn test_tampered_kdf_params_fail_authentication() {
        let secret = MasterSecret::from(SECRET);
        let set = initialize(&secret, &fast_params(), &vault()).unwrap();

        let mut huge = set.clone();
        huge.kdf.memory_cost = u32::MAX;
        assert!(matches!(
            unwrap(&secret, &huge, &vault()),
            Err(Error::Authentication)
        ));

        let mut zero = set.clone();
        zero.kdf.time_cost = 0;
        assert!(matches!(
            unwrap(&secret, &zero, &vault()),
            Err(Error::Authentication)
        ));
    }

    #[test]
    fn test_wrapped_key_bound_to_vault_id() {
        let secret = MasterSecret::from(SECRET);
        let set = initialize(&secret, &fast_params(), &vault()).unwrap();

        let other = VaultId::new("another-vault").unwrap();
        assert!(matches!(
            unwrap(&secret, &set, &other),
            Err(Error::Authentication)
        ));
    }

    #[test]
    fn test_rewrap_keeps_data_key() {
        let old = MasterSecret::from(SECRET);
        let new = MasterSecret::from("tr0ub4dor&3-but-longer");
        let set = initialize(&old, &fast_params(), &vault()).unwrap();
        let before = unwrap(&old, &set, &vault()).unwrap();

        let rewrapped = rewrap(&old, &new, &set, &fast_params(), &vault()).unwrap();
        assert_ne!(rewrapped.salt, set.salt);

        let after = unwrap(&new, &rewrapped, &vault()).unwrap();
        assert_eq!(before.active().as_bytes(), after.active().as_bytes());

        assert!(matches!(
            unwrap(&old, &rewrapped, &vault()),
            Err(Error::Authentication)
        ));
    }

    #[test]
    fn test_rewrap_with_wrong_old_secret() {
        let set = initialize(&SECRET.into(), &fast_params(), &vault()).unwrap();
        let result = rewrap(
            &"wrong-old-secret".into(),
            &"brand-new-secret".into(),
            &set,
            &fast_params(),
            &vault(),
        );
        assert!(matches!(result, Err(Error::Authentication)));
    }

    #[test]
    fn test_rewrap_can_change_params() {
        let set = initialize(&SECRET.into(), &fast_params(), &vault()).unwrap();
        let mut stronger = fast_params();
        stronger.time_cost = 2;

        let rewrapped = rewrap(
            &SECRET.into(),
            &"brand-new-secret".into(),
            &set,
            &stronger,
            &vault(),
        )
        .unwrap();
        assert_eq!(rewrapped.kdf.time_cost, 2);
        assert!(unwrap(&"brand-new-secret".into(), &rewrapped, &vault()).is_ok());
    }

    #[test]
    fn test_add_epoch_retains_old_keys() {
        let secret = MasterSecret::from(SECRET);
        let set = initialize(&secret, &fast_params(), &vault()).unwrap();
        let original = unwrap(&secret, &set, &vault()).unwrap();

        let (rotated_set, ring) = add_epoch(&secret, &set, &vault()).unwrap();
        assert_eq!(rotated_set.active_epoch, 2);
        assert_eq!(ring.active_epoch(), 2);
        assert_eq!(
            ring.get(1).unwrap().as_bytes(),
            original.active().as_bytes()
        );
        assert_ne!(ring.active().as_bytes(), original.active().as_bytes());

        let reopened = unwrap(&secret, &rotated_set, &vault()).unwrap();
        assert_eq!(reopened.epochs().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_set_serialization() {
        let set = initialize(&SECRET.into(), &fast_params(), &vault()).unwrap();
        let json = serde_json::to_string(&set).unwrap();
        let back: WrappedKeySet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, set);
    }
}
