//! Local filesystem record store.
//!
//! Layout under the root directory:
//! - `vault.json`: the vault header
//! - `records/<hex(blake2b-256(id))>.json`: one file per record
//!
//! File names have a fixed length whatever the id, so every valid id fits
//! the filesystem's name limit. The id itself is read back from the record.
//!
//! Every write goes to a uniquely named temp file in the target directory,
//! is synced, then renamed over the target. Readers therefore see either
//! the previous or the new content.

use async_trait::async_trait;
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use futures::stream;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::fmt::Write as _;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::provider::{IdStream, RecordStore};
use crate::record::SecretRecord;
use mqvault_common::{Error, Result, SecretId};

/// Header file name in the store root.
pub const HEADER_FILENAME: &str = "vault.json";

/// Records directory name in the store root.
pub const RECORDS_DIRNAME: &str = "records";

const RECORD_EXTENSION: &str = "json";
const TEMP_SUFFIX: &str = ".tmp";

type IdLocks = Mutex<HashMap<SecretId, Arc<tokio::sync::Mutex<()>>>>;

/// Directory-backed record store.
pub struct LocalStore {
    root: PathBuf,
    records: PathBuf,
    id_locks: IdLocks,
    header_lock: tokio::sync::Mutex<()>,
}

impl LocalStore {
    /// Open (or create) a store rooted at `root`.
    ///
    /// # Postconditions
    /// - Root and records directories exist
    /// - Temp files left behind by interrupted writes are removed
    ///
    /// # Errors
    /// - Permission denied or other I/O failure
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let records = root.join(RECORDS_DIRNAME);

        std::fs::create_dir_all(&records)?;
        remove_stale_temp_files(&root)?;
        remove_stale_temp_files(&records)?;

        Ok(Self {
            root,
            records,
            id_locks: Mutex::new(HashMap::new()),
            header_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Root directory of this store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn header_path(&self) -> PathBuf {
        self.root.join(HEADER_FILENAME)
    }

    fn record_path(&self, id: &SecretId) -> PathBuf {
        self.records.join(record_file_name(id))
    }

    fn id_lock(&self, id: &SecretId) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self
            .id_locks
            .lock()
            .map_err(|_| Error::Storage("Record lock table poisoned".to_string()))?;
        Ok(locks.entry(id.clone()).or_default().clone())
    }

    fn release_id_lock(&self, id: &SecretId, lock: Arc<tokio::sync::Mutex<()>>) {
        if let Ok(mut locks) = self.id_locks.lock() {
            // Only the table and this caller hold it: nobody is waiting.
            if Arc::strong_count(&lock) == 2 {
                locks.remove(id);
            }
        }
    }
}

fn is_temp_file(name: &OsStr) -> bool {
    name.to_str()
        .map(|n| n.starts_with('.') && n.ends_with(TEMP_SUFFIX))
        .unwrap_or(false)
}

fn remove_stale_temp_files(dir: &Path) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if is_temp_file(&entry.file_name()) {
            warn!(path = %entry.path().display(), "Removing temp file from interrupted write");
            std::fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

fn record_file_name(id: &SecretId) -> String {
    let digest = Blake2b::<U32>::digest(id.as_bytes());
    let mut name = String::with_capacity(digest.len() * 2 + 1 + RECORD_EXTENSION.len());
    for byte in digest.iter() {
        let _ = write!(name, "{:02x}", byte);
    }
    name.push('.');
    name.push_str(RECORD_EXTENSION);
    name
}

fn is_record_file(name: &OsStr) -> bool {
    name.to_str()
        .map(|n| !n.starts_with('.') && n.ends_with(RECORD_EXTENSION))
        .unwrap_or(false)
}

/// Read the id stored in a record file. Unreadable files are skipped.
async fn read_record_id(path: &Path) -> Option<SecretId> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        // Deleted since the directory was read.
        Err(e) if e.kind() == ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Skipping unreadable record file");
            return None;
        }
    };
    match SecretRecord::from_bytes(&bytes) {
        Ok(record) => Some(record.id),
        Err(_) => {
            warn!(path = %path.display(), "Skipping corrupted record file");
            None
        }
    }
}

fn map_not_found(e: std::io::Error, what: impl FnOnce() -> String) -> Error {
    if e.kind() == ErrorKind::NotFound {
        Error::NotFound(what())
    } else {
        Error::Io(e)
    }
}

/// Write `data` to `target` via temp file + rename.
async fn write_atomic(target: &Path, data: &[u8]) -> Result<()> {
    let file_name = target
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::InvalidInput("Invalid target path".to_string()))?;
    let tmp = target.with_file_name(format!(
        ".{}.{}{}",
        file_name,
        Uuid::new_v4().simple(),
        TEMP_SUFFIX
    ));

    let written = async {
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, target).await
    }
    .await;

    if let Err(e) = written {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }

    #[cfg(unix)]
    {
        if let Some(parent) = target.parent() {
            if let Ok(dir) = fs::File::open(parent).await {
                let _ = dir.sync_all().await;
            }
        }
    }

    Ok(())
}

#[async_trait]
impl RecordStore for LocalStore {
    fn name(&self) -> &str {
        "local"
    }

    async fn read_header(&self) -> Result<Option<Vec<u8>>> {
        match fs::read(self.header_path()).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_header(&self, data: Vec<u8>) -> Result<()> {
        let _guard = self.header_lock.lock().await;
        write_atomic(&self.header_path(), &data).await?;
        debug!(size = data.len(), "Header written");
        Ok(())
    }

    async fn put(&self, record: &SecretRecord) -> Result<()> {
        let bytes = record.to_bytes()?;
        let path = self.record_path(&record.id);

        let lock = self.id_lock(&record.id)?;
        let result = {
            let _guard = lock.lock().await;
            write_atomic(&path, &bytes).await
        };
        self.release_id_lock(&record.id, lock);

        result?;
        debug!(id = %record.id, version = record.version, "Record written");
        Ok(())
    }

    async fn get(&self, id: &SecretId) -> Result<SecretRecord> {
        let bytes = fs::read(self.record_path(id))
            .await
            .map_err(|e| map_not_found(e, || format!("Record not found: {}", id)))?;

        // An unparseable record file is a corrupted record.
        SecretRecord::from_bytes(&bytes).map_err(|_| Error::Integrity(id.to_string()))
    }

    async fn delete(&self, id: &SecretId) -> Result<()> {
        let lock = self.id_lock(id)?;
        let result = {
            let _guard = lock.lock().await;
            fs::remove_file(self.record_path(id))
                .await
                .map_err(|e| map_not_found(e, || format!("Record not found: {}", id)))
        };
        self.release_id_lock(id, lock);

        result?;
        debug!(id = %id, "Record deleted");
        Ok(())
    }

    async fn list(&self) -> Result<IdStream> {
        let entries = fs::read_dir(&self.records).await?;

        let ids = stream::unfold(Some(entries), |state| async move {
            let mut entries = state?;
            loop {
                match entries.next_entry().await {
                    Ok(Some(entry)) => {
                        if !is_record_file(&entry.file_name()) {
                            continue;
                        }
                        if let Some(id) = read_record_id(&entry.path()).await {
                            return Some((Ok(id), Some(entries)));
                        }
                    }
                    Ok(None) => return None,
                    // Surface the error once, then end the stream.
                    Err(e) => return Some((Err(Error::Io(e)), None)),
                }
            }
        });

        Ok(Box::pin(ids))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::sample_record;
    use futures::TryStreamExt;
    use mqvault_common::MAX_SECRET_ID_LEN;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_local_put_get() {
        let temp = TempDir::new().unwrap();
        let store = LocalStore::new(temp.path()).unwrap();
        let record = sample_record("db/password", 1);

        store.put(&record).await.unwrap();
        let loaded = store.get(&record.id).await.unwrap();

        assert_eq!(loaded, record);
    }

    #[tokio::test]
    async fn test_local_overwrite_replaces_whole_record() {
        let temp = TempDir::new().unwrap();
        let store = LocalStore::new(temp.path()).unwrap();

        store.put(&sample_record("k1", 1)).await.unwrap();
        store.put(&sample_record("k1", 2)).await.unwrap();

        let loaded = store.get(&SecretId::new("k1").unwrap()).await.unwrap();
        assert_eq!(loaded, sample_record_like(&loaded, 2));
    }

    fn sample_record_like(loaded: &SecretRecord, version: u64) -> SecretRecord {
        let mut expected = sample_record("k1", version);
        expected.created_at = loaded.created_at;
        expected.updated_at = loaded.updated_at;
        expected
    }

    #[tokio::test]
    async fn test_local_get_missing() {
        let temp = TempDir::new().unwrap();
        let store = LocalStore::new(temp.path()).unwrap();

        let result = store.get(&SecretId::new("nope").unwrap()).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_local_delete() {
        let temp = TempDir::new().unwrap();
        let store = LocalStore::new(temp.path()).unwrap();
        let record = sample_record("k1", 1);

        store.put(&record).await.unwrap();
        store.delete(&record.id).await.unwrap();

        assert!(!store.exists(&record.id).await.unwrap());
        assert!(matches!(
            store.delete(&record.id).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_local_list_is_restartable() {
        let temp = TempDir::new().unwrap();
        let store = LocalStore::new(temp.path()).unwrap();

        for id in ["a", "b/c", "d e"] {
            store.put(&sample_record(id, 1)).await.unwrap();
        }

        let mut first: Vec<String> = store
            .list()
            .await
            .unwrap()
            .map_ok(|id| id.to_string())
            .try_collect()
            .await
            .unwrap();
        first.sort();
        assert_eq!(first, vec!["a", "b/c", "d e"]);

        let second: Vec<SecretId> = store.list().await.unwrap().try_collect().await.unwrap();
        assert_eq!(second.len(), 3);
    }

    #[tokio::test]
    async fn test_longest_ids_fit_file_names() {
        let temp = TempDir::new().unwrap();
        let store = LocalStore::new(temp.path()).unwrap();

        let ascii = "a".repeat(MAX_SECRET_ID_LEN);
        // Three bytes per character.
        let multibyte = "\u{20ac}".repeat(MAX_SECRET_ID_LEN / 3);
        for id in [ascii.as_str(), multibyte.as_str()] {
            let record = sample_record(id, 1);
            store.put(&record).await.unwrap();
            assert_eq!(store.get(&record.id).await.unwrap(), record);
        }

        let name = store.record_path(&SecretId::new(ascii.as_str()).unwrap());
        assert_eq!(name.file_name().unwrap().len(), 64 + 1 + RECORD_EXTENSION.len());

        let mut ids: Vec<String> = store
            .list()
            .await
            .unwrap()
            .map_ok(|id| id.to_string())
            .try_collect()
            .await
            .unwrap();
        ids.sort();
        assert_eq!(ids, vec![ascii, multibyte]);
    }

    #[tokio::test]
    async fn test_list_skips_corrupted_files() {
        let temp = TempDir::new().unwrap();
        let store = LocalStore::new(temp.path()).unwrap();
        store.put(&sample_record("good", 1)).await.unwrap();
        std::fs::write(temp.path().join(RECORDS_DIRNAME).join("junk.json"), b"{").unwrap();

        let ids: Vec<SecretId> = store.list().await.unwrap().try_collect().await.unwrap();
        assert_eq!(ids, vec![SecretId::new("good").unwrap()]);
    }

    #[tokio::test]
    async fn test_stale_temp_files_removed_and_ignored() {
        let temp = TempDir::new().unwrap();
        {
            let store = LocalStore::new(temp.path()).unwrap();
            store.put(&sample_record("k1", 1)).await.unwrap();
        }

        let stale = temp
            .path()
            .join(RECORDS_DIRNAME)
            .join(".interrupted.json.0000.tmp");
        std::fs::write(&stale, b"partial").unwrap();

        let store = LocalStore::new(temp.path()).unwrap();
        assert!(!stale.exists());

        let ids: Vec<SecretId> = store.list().await.unwrap().try_collect().await.unwrap();
        assert_eq!(ids, vec![SecretId::new("k1").unwrap()]);
    }

    #[tokio::test]
    async fn test_corrupted_record_file_is_integrity_error() {
        let temp = TempDir::new().unwrap();
        let store = LocalStore::new(temp.path()).unwrap();
        let record = sample_record("k1", 1);
        store.put(&record).await.unwrap();

        std::fs::write(store.record_path(&record.id), b"{\"id\":").unwrap();

        assert!(matches!(
            store.get(&record.id).await,
            Err(Error::Integrity(_))
        ));
    }

    #[tokio::test]
    async fn test_header_roundtrip() {
        let temp = TempDir::new().unwrap();
        let store = LocalStore::new(temp.path()).unwrap();

        assert!(store.read_header().await.unwrap().is_none());
        store.write_header(b"{\"v\":1}".to_vec()).await.unwrap();
        store.write_header(b"{\"v\":2}".to_vec()).await.unwrap();
        assert_eq!(
            store.read_header().await.unwrap().unwrap(),
            b"{\"v\":2}".to_vec()
        );
    }

    #[tokio::test]
    async fn test_concurrent_writes_same_id() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(LocalStore::new(temp.path()).unwrap());

        let tasks: Vec<_> = (1..=16u64)
            .map(|v| {
                let store = store.clone();
                tokio::spawn(async move { store.put(&sample_record("shared", v)).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        // Whatever write won, the file is one complete record.
        let loaded = store.get(&SecretId::new("shared").unwrap()).await.unwrap();
        assert!((1..=16).contains(&loaded.version));
        assert_eq!(
            loaded.ciphertext,
            format!("ciphertext-of-shared-v{}", loaded.version).into_bytes()
        );

        assert!(store.id_locks.lock().unwrap().is_empty());
    }
}
