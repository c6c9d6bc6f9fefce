//! Authenticated encryption using XChaCha20-Poly1305.
//!
//! XChaCha20-Poly1305 provides both confidentiality and authenticity,
//! with a 24-byte nonce. Records use the detached form so the tag is
//! stored as its own field; wrapped keys use the combined
//! `nonce || ciphertext || tag` layout.

use chacha20poly1305::{
    aead::{AeadCore, AeadInPlace, KeyInit, OsRng},
    Key, Tag, XChaCha20Poly1305, XNonce,
};
use zeroize::Zeroizing;

use crate::keys::KEY_LENGTH;
use mqvault_common::{Error, Result};

/// Nonce size for XChaCha20-Poly1305 (24 bytes).
pub const NONCE_SIZE: usize = 24;

/// Authentication tag size (16 bytes).
pub const TAG_SIZE: usize = 16;

/// Domain prefix for record associated data.
const RECORD_AAD_DOMAIN: &[u8] = b"mqvault/record/v1";

/// Build the associated data that binds a record to its id, key epoch and
/// version.
pub fn record_aad(record_id: &[u8], epoch: u32, version: u64) -> Vec<u8> {
    let mut aad = Vec::with_capacity(RECORD_AAD_DOMAIN.len() + 20 + record_id.len());
    aad.extend_from_slice(RECORD_AAD_DOMAIN);
    aad.extend_from_slice(&epoch.to_be_bytes());
    aad.extend_from_slice(&version.to_be_bytes());
    aad.extend_from_slice(&(record_id.len() as u64).to_be_bytes());
    aad.extend_from_slice(record_id);
    aad
}

/// Encrypt with a caller-provided nonce, returning ciphertext and tag
/// separately.
///
/// # Preconditions
/// - `nonce` must never repeat for the same key
///
/// # Errors
/// - Returns error if encryption fails
pub fn seal_detached(
    key: &[u8; KEY_LENGTH],
    nonce: &[u8; NONCE_SIZE],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<(Vec<u8>, [u8; TAG_SIZE])> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(XNonce::from_slice(nonce), aad, &mut buffer)
        .map_err(|e| Error::Crypto(format!("Encryption failed: {}", e)))?;

    let mut tag_bytes = [0u8; TAG_SIZE];
    tag_bytes.copy_from_slice(&tag);
    Ok((buffer, tag_bytes))
}

/// Verify and decrypt a detached ciphertext.
///
/// The plaintext is only materialized after the tag verifies; on failure
/// the scratch buffer is zeroized and an error is returned.
///
/// # Errors
/// - Returns error if the nonce or tag have the wrong length
/// - Returns error if authentication fails (tampered data or wrong key)
pub fn open_detached(
    key: &[u8; KEY_LENGTH],
    nonce: &[u8],
    aad: &[u8],
    ciphertext: &[u8],
    tag: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    if nonce.len() != NONCE_SIZE {
        return Err(Error::Crypto("Invalid nonce length".to_string()));
    }
    if tag.len() != TAG_SIZE {
        return Err(Error::Crypto("Invalid tag length".to_string()));
    }

    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));

    let mut buffer = Zeroizing::new(ciphertext.to_vec());
    cipher
        .decrypt_in_place_detached(
            XNonce::from_slice(nonce),
            aad,
            buffer.as_mut_slice(),
            Tag::from_slice(tag),
        )
        .map_err(|_| Error::Crypto("Decryption failed".to_string()))?;

    Ok(buffer)
}

/// Encrypt with a random nonce.
///
/// # Postconditions
/// - Returns nonce || ciphertext || tag
pub fn encrypt(key: &[u8; KEY_LENGTH], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let generated = XChaCha20Poly1305::generate_nonce(&mut OsRng);
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&generated);

    let (ciphertext, tag) = seal_detached(key, &nonce, aad, plaintext)?;

    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len() + TAG_SIZE);
    result.extend_from_slice(&nonce);
    result.extend_from_slice(&ciphertext);
    result.extend_from_slice(&tag);
    Ok(result)
}

/// Decrypt the output of [`encrypt`].
///
/// # Errors
/// - Returns error if the input is too short
/// - Returns error if authentication fails
pub fn decrypt(key: &[u8; KEY_LENGTH], aad: &[u8], data: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    if data.len() < NONCE_SIZE + TAG_SIZE {
        return Err(Error::Crypto("Ciphertext too short".to_string()));
    }

    let (nonce, rest) = data.split_at(NONCE_SIZE);
    let (ciphertext, tag) = rest.split_at(rest.len() - TAG_SIZE);
    open_detached(key, nonce, aad, ciphertext, tag)
}
