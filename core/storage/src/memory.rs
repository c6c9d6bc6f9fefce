//! In-memory record store for testing.

use async_trait::async_trait;
use futures::stream;
use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::provider::{IdStream, RecordStore};
use crate::record::SecretRecord;
use mqvault_common::{Error, Result, SecretId};

#[derive(Default)]
struct Contents {
    header: Option<Vec<u8>>,
    records: BTreeMap<SecretId, SecretRecord>,
}

/// In-memory record store.
///
/// Useful for testing and ephemeral vaults. All data is stored in memory
/// and lost on drop. Each call swaps whole values under a lock, which
/// makes every write atomic.
#[derive(Default)]
pub struct MemoryStore {
    contents: RwLock<Contents>,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Contents>> {
        self.contents
            .read()
            .map_err(|_| Error::Storage("Memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Contents>> {
        self.contents
            .write()
            .map_err(|_| Error::Storage("Memory store lock poisoned".to_string()))
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.read().map(|c| c.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn read_header(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.read()?.header.clone())
    }

    async fn write_header(&self, data: Vec<u8>) -> Result<()> {
        self.write()?.header = Some(data);
        Ok(())
    }

    async fn put(&self, record: &SecretRecord) -> Result<()> {
        self.write()?
            .records
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, id: &SecretId) -> Result<SecretRecord> {
        self.read()?
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Record not found: {}", id)))
    }

    async fn delete(&self, id: &SecretId) -> Result<()> {
        self.write()?
            .records
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("Record not found: {}", id)))
    }

    async fn list(&self) -> Result<IdStream> {
        let ids: Vec<SecretId> = self.read()?.records.keys().cloned().collect();
        Ok(Box::pin(stream::iter(ids.into_iter().map(Ok))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::sample_record;
    use futures::TryStreamExt;

    #[tokio::test]
    async fn test_put_get() {
        let store = MemoryStore::new();
        let record = sample_record("k1", 1);

        store.put(&record).await.unwrap();
        assert_eq!(store.get(&record.id).await.unwrap(), record);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = MemoryStore::new();
        let record = sample_record("k1", 1);

        store.put(&record).await.unwrap();
        store.delete(&record.id).await.unwrap();

        assert!(store.is_empty());
        assert!(matches!(
            store.get(&record.id).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            store.delete(&record.id).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_sorted_snapshot() {
        let store = MemoryStore::new();
        for id in ["b", "a", "c"] {
            store.put(&sample_record(id, 1)).await.unwrap();
        }

        let listed = store.list().await.unwrap();
        // Writes after listing don't affect a stream already taken.
        store.put(&sample_record("d", 1)).await.unwrap();

        let ids: Vec<String> = listed.map_ok(|id| id.to_string()).try_collect().await.unwrap();
        assert_eq!(ids, vec!["a", "b", "c"]);

        let again: Vec<SecretId> = store.list().await.unwrap().try_collect().await.unwrap();
        assert_eq!(again.len(), 4);
    }

    #[tokio::test]
    async fn test_header() {
        let store = MemoryStore::new();
        assert!(store.read_header().await.unwrap().is_none());

        store.write_header(vec![1, 2, 3]).await.unwrap();
        assert_eq!(store.read_header().await.unwrap(), Some(vec![1, 2, 3]));
    }
}
