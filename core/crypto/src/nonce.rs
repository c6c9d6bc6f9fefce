//! Collision-free nonce generation for record encryption.
//!
//! A sequence is created together with each unlocked key ring: a random
//! 16-byte prefix followed by a 64-bit big-endian counter. Within one
//! sequence two nonces can never be equal, and the random prefix keeps
//! sequences from different unlocks apart.

use rand::RngCore;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::aead::NONCE_SIZE;
use mqvault_common::{Error, Result};

const PREFIX_SIZE: usize = NONCE_SIZE - 8;

/// Monotonic nonce source for one data key.
pub struct NonceSequence {
    prefix: [u8; PREFIX_SIZE],
    counter: AtomicU64,
}

impl NonceSequence {
    /// Start a sequence with a fresh random prefix.
    pub fn new() -> Self {
        let mut prefix = [0u8; PREFIX_SIZE];
        rand::thread_rng().fill_bytes(&mut prefix);
        Self::with_prefix(prefix, 0)
    }

    fn with_prefix(prefix: [u8; PREFIX_SIZE], start: u64) -> Self {
        Self {
            prefix,
            counter: AtomicU64::new(start),
        }
    }

    /// Take the next nonce.
    ///
    /// # Errors
    /// - The counter is exhausted; it never wraps around
    pub fn next(&self) -> Result<[u8; NONCE_SIZE]> {
        let counter = self
            .counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_add(1))
            .map_err(|_| Error::Crypto("Nonce sequence exhausted".to_string()))?;

        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..PREFIX_SIZE].copy_from_slice(&self.prefix);
        nonce[PREFIX_SIZE..].copy_from_slice(&counter.to_be_bytes());
        Ok(nonce)
    }
}

impl Default for NonceSequence {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_builds_prefix_and_big_endian_counter() {
        let seq = NonceSequence::with_prefix([7u8; PREFIX_SIZE], 0x0102_0304_0506_0708);
        let nonce = seq.next().unwrap();
        assert_eq!(&nonce[..PREFIX_SIZE], &[7u8; PREFIX_SIZE]);
        assert_eq!(&nonce[PREFIX_SIZE..], &0x0102_0304_0506_0708u64.to_be_bytes());
    }

    #[test]
    fn test_sequential_nonces_unique() {
        let seq = NonceSequence::new();
        let nonces: HashSet<_> = (0..10_000).map(|_| seq.next().unwrap()).collect();
        assert_eq!(nonces.len(), 10_000);
    }

    #[test]
    fn test_concurrent_nonces_unique() {
        let seq = Arc::new(NonceSequence::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let seq = seq.clone();
                std::thread::spawn(move || (0..1000).map(|_| seq.next().unwrap()).collect::<Vec<_>>())
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            for nonce in handle.join().unwrap() {
                assert!(all.insert(nonce));
            }
        }
        assert_eq!(all.len(), 4000);
    }

    #[test]
    fn test_exhaustion_is_an_error_not_a_wrap() {
        let seq = NonceSequence::with_prefix([0u8; PREFIX_SIZE], u64::MAX - 1);
        assert!(seq.next().is_ok());
        assert!(seq.next().is_err());
        assert!(seq.next().is_err());
    }

    #[test]
    fn test_sequences_have_distinct_prefixes() {
        let a = NonceSequence::new().next().unwrap();
        let b = NonceSequence::new().next().unwrap();
        assert_ne!(a, b);
    }
}
