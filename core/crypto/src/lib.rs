//! Cryptographic primitives for MQVault.
//!
//! This module provides:
//! - Key derivation using Argon2id
//! - Data key generation, wrapping, rewrapping, and epoch rotation
//! - Authenticated encryption using XChaCha20-Poly1305
//! - Counter-based nonce sequences that cannot repeat
//!
//! # Security Guarantees
//! - All key material is automatically zeroized on drop
//! - No plaintext or key material is ever logged
//! - Unwrap failures never reveal whether the secret or the blob was at fault

pub mod aead;
pub mod kdf;
pub mod keys;
pub mod nonce;
pub mod wrap;

pub use aead::{open_detached, record_aad, seal_detached, NONCE_SIZE, TAG_SIZE};
pub use kdf::{derive_wrapping_key, KdfAlgorithm, KdfParams};
pub use keys::{DataKey, KeyRing, MasterSecret, RecordKey, Salt, KEY_LENGTH};
pub use nonce::NonceSequence;
pub use wrap::{add_epoch, initialize, rewrap, unwrap, WrappedKey, WrappedKeySet};
