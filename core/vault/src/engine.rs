//! Record encryption and decryption on top of a session.

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::session::SessionManager;
use mqvault_common::{Error, Result, SecretId};
use mqvault_crypto::{open_detached, record_aad, seal_detached};
use mqvault_storage::{bounded, RecordStore, SecretRecord};

/// Seals and opens records.
///
/// Holds no keys of its own: every cryptographic step borrows the key ring
/// from the session for its duration. Cloning is cheap.
#[derive(Clone)]
pub struct VaultEngine {
    session: Arc<SessionManager>,
    store: Arc<dyn RecordStore>,
    io_timeout: Option<Duration>,
}

impl VaultEngine {
    /// Create an engine. Each store call is limited to `io_timeout`.
    pub fn new(
        session: Arc<SessionManager>,
        store: Arc<dyn RecordStore>,
        io_timeout: Option<Duration>,
    ) -> Self {
        Self {
            session,
            store,
            io_timeout,
        }
    }

    /// Copy of this engine with a different store time limit.
    pub fn with_io_timeout(&self, io_timeout: Option<Duration>) -> Self {
        Self {
            io_timeout,
            ..self.clone()
        }
    }

    async fn io<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        bounded(self.io_timeout, call).await
    }

    /// Encrypt `plaintext` and store it under `id`.
    ///
    /// Overwrites an existing record, bumping its version.
    ///
    /// # Preconditions
    /// - Vault must be unlocked
    ///
    /// # Postconditions
    /// - Record is sealed under the active data key with a fresh nonce
    ///
    /// # Errors
    /// - `Locked` before any store access if the vault is locked
    /// - Storage failures, including `Timeout`
    pub async fn seal(&self, id: &SecretId, plaintext: &[u8]) -> Result<SecretRecord> {
        self.session.ensure_unlocked().await?;

        let (version, created_at) = match self.io(self.store.get(id)).await {
            Ok(existing) => (existing.version + 1, existing.created_at),
            Err(Error::NotFound(_)) => (1, Utc::now()),
            Err(e) => return Err(e),
        };

        let record = self.encrypt(id, plaintext, version, created_at).await?;
        self.io(self.store.put(&record)).await?;

        debug!(id = %id, epoch = record.key_epoch, version, "Sealed secret");
        Ok(record)
    }

    /// Fetch and decrypt the record stored under `id`.
    ///
    /// # Errors
    /// - `Locked` before any store access if the vault is locked
    /// - `NotFound` if no record exists
    /// - `Integrity` if the record fails authentication. Never retried.
    pub async fn open(&self, id: &SecretId) -> Result<Zeroizing<Vec<u8>>> {
        self.session.ensure_unlocked().await?;

        let record = self.io(self.store.get(id)).await?;
        let plaintext = self.decrypt(id, &record).await?;

        debug!(id = %id, epoch = record.key_epoch, "Opened secret");
        Ok(plaintext)
    }

    /// Re-encrypt one record under the active data key.
    ///
    /// # Postconditions
    /// - Plaintext is unchanged, version is incremented
    ///
    /// # Errors
    /// - Same as [`VaultEngine::open`]
    pub async fn rotate(&self, id: &SecretId) -> Result<SecretRecord> {
        self.session.ensure_unlocked().await?;

        let record = self.io(self.store.get(id)).await?;
        let rotated = self.reseal(id, &record).await?;

        info!(
            id = %id,
            from_epoch = record.key_epoch,
            to_epoch = rotated.key_epoch,
            version = rotated.version,
            "Rotated secret"
        );
        Ok(rotated)
    }

    /// Re-encrypt every record not yet on the active data key.
    ///
    /// Returns the number of records rotated. Records deleted while the
    /// pass runs are skipped.
    pub async fn rotate_all(&self) -> Result<usize> {
        let active = self
            .session
            .with_unlocked(|ring| Ok(ring.active_epoch()))
            .await?;

        let mut rotated = 0;
        for id in self.list().await? {
            let record = match self.io(self.store.get(&id)).await {
                Ok(record) => record,
                Err(Error::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if record.key_epoch == active {
                continue;
            }
            self.reseal(&id, &record).await?;
            rotated += 1;
        }

        info!(rotated, epoch = active, "Rotation pass complete");
        Ok(rotated)
    }

    /// Remove the record stored under `id`.
    ///
    /// # Errors
    /// - `Locked` if the vault is locked
    /// - `NotFound` if no record exists
    pub async fn delete(&self, id: &SecretId) -> Result<()> {
        self.session.ensure_unlocked().await?;
        self.io(self.store.delete(id)).await?;
        debug!(id = %id, "Deleted secret");
        Ok(())
    }

    /// Ids of all stored records, sorted.
    pub async fn list(&self) -> Result<Vec<SecretId>> {
        self.session.ensure_unlocked().await?;

        let stream = self.io(self.store.list()).await?;
        let mut ids: Vec<SecretId> = self.io(stream.try_collect()).await?;
        ids.sort();
        Ok(ids)
    }

    async fn reseal(&self, id: &SecretId, record: &SecretRecord) -> Result<SecretRecord> {
        let plaintext = self.decrypt(id, record).await?;
        let rotated = self
            .encrypt(id, &plaintext, record.version + 1, record.created_at)
            .await?;
        self.io(self.store.put(&rotated)).await?;
        Ok(rotated)
    }

    async fn encrypt(
        &self,
        id: &SecretId,
        plaintext: &[u8],
        version: u64,
        created_at: DateTime<Utc>,
    ) -> Result<SecretRecord> {
        self.session
            .with_unlocked(|ring| {
                let key = ring.active();
                let record_key = key.derive_record_key(id.as_bytes());
                let nonce = ring.next_nonce()?;
                let aad = record_aad(id.as_bytes(), key.epoch(), version);
                let (ciphertext, tag) =
                    seal_detached(record_key.as_bytes(), &nonce, &aad, plaintext)?;

                Ok(SecretRecord {
                    id: id.clone(),
                    key_epoch: key.epoch(),
                    nonce: nonce.to_vec(),
                    ciphertext,
                    tag: tag.to_vec(),
                    version,
                    created_at,
                    updated_at: Utc::now(),
                })
            })
            .await
    }

    /// Decrypt a record. Authentication is against the requested `id`, so a
    /// record copied to another id fails as well.
    async fn decrypt(&self, id: &SecretId, record: &SecretRecord) -> Result<Zeroizing<Vec<u8>>> {
        let result = self
            .session
            .with_unlocked(|ring| {
                let key = ring
                    .get(record.key_epoch)
                    .ok_or_else(|| Error::Integrity(id.to_string()))?;
                let record_key = key.derive_record_key(id.as_bytes());
                let aad = record_aad(id.as_bytes(), record.key_epoch, record.version);
                open_detached(
                    record_key.as_bytes(),
                    &record.nonce,
                    &aad,
                    &record.ciphertext,
                    &record.tag,
                )
                .map_err(|_| Error::Integrity(id.to_string()))
            })
            .await;

        if let Err(Error::Integrity(_)) = &result {
            warn!(id = %id, epoch = record.key_epoch, "Record failed authentication");
        }
        result
    }
}
