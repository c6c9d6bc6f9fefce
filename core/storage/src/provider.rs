//! Record store trait definition.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::record::SecretRecord;
use mqvault_common::{Error, Result, SecretId};

/// Lazy stream of record ids.
///
/// The stream is finite. Calling [`RecordStore::list`] again starts a new
/// one from the beginning.
pub type IdStream = BoxStream<'static, Result<SecretId>>;

/// Persistence backend for vault data.
///
/// Backends hold two things: the vault header blob and one record per
/// secret. Both are opaque bytes here. The single hard guarantee is
/// atomicity: an overwrite leaves either the old value or the new value,
/// never a mix, even across a crash.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Get the backend name (e.g., "local", "memory").
    fn name(&self) -> &str;

    /// Read the vault header, if one has been written.
    async fn read_header(&self) -> Result<Option<Vec<u8>>>;

    /// Atomically replace the vault header.
    async fn write_header(&self, data: Vec<u8>) -> Result<()>;

    /// Persist or overwrite a record.
    ///
    /// # Postconditions
    /// - A subsequent `get` returns exactly `record`
    async fn put(&self, record: &SecretRecord) -> Result<()>;

    /// Fetch a record.
    ///
    /// # Errors
    /// - `NotFound` if no record exists for `id`
    async fn get(&self, id: &SecretId) -> Result<SecretRecord>;

    /// Remove a record.
    ///
    /// # Errors
    /// - `NotFound` if no record exists for `id`
    async fn delete(&self, id: &SecretId) -> Result<()>;

    /// List the ids of all stored records.
    async fn list(&self) -> Result<IdStream>;

    /// Check whether a record exists.
    async fn exists(&self, id: &SecretId) -> Result<bool> {
        match self.get(id).await {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
