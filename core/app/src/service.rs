//! Typed vault service and request dispatch.

use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::protocol::{Command, OpenedValue, Outcome, Request, Response};
use mqvault_common::{Result, SecretId, VaultId};
use mqvault_crypto::MasterSecret;
use mqvault_storage::SecretRecord;
use mqvault_vault::{SessionStatus, Vault, VaultEngine};

/// Facade over an opened vault.
///
/// Cloning is cheap; clones share the same session.
#[derive(Clone)]
pub struct VaultService {
    vault: Vault,
    verbose: bool,
}

impl VaultService {
    pub fn new(vault: Vault, verbose: bool) -> Self {
        Self { vault, verbose }
    }

    fn engine(&self, timeout: Option<Duration>) -> VaultEngine {
        match timeout {
            Some(limit) => self.vault.engine.with_io_timeout(Some(limit)),
            None => self.vault.engine.clone(),
        }
    }

    pub async fn initialize(&self, secret: MasterSecret) -> Result<VaultId> {
        self.vault.session.initialize(secret).await
    }

    pub async fn unlock(&self, secret: MasterSecret) -> Result<()> {
        self.vault.session.unlock(secret).await
    }

    pub async fn lock(&self) -> Result<()> {
        self.vault.session.lock().await
    }

    pub async fn seal(
        &self,
        id: &SecretId,
        plaintext: &[u8],
        timeout: Option<Duration>,
    ) -> Result<SecretRecord> {
        self.engine(timeout).seal(id, plaintext).await
    }

    pub async fn open(&self, id: &SecretId, timeout: Option<Duration>) -> Result<Zeroizing<Vec<u8>>> {
        self.engine(timeout).open(id).await
    }

    pub async fn delete(&self, id: &SecretId, timeout: Option<Duration>) -> Result<()> {
        self.engine(timeout).delete(id).await
    }

    pub async fn list(&self, timeout: Option<Duration>) -> Result<Vec<SecretId>> {
        self.engine(timeout).list().await
    }

    pub async fn change_master_secret(&self, old: MasterSecret, new: MasterSecret) -> Result<()> {
        self.vault.session.change_master_secret(old, new).await
    }

    pub async fn rotate(&self, id: &SecretId, timeout: Option<Duration>) -> Result<SecretRecord> {
        self.engine(timeout).rotate(id).await
    }

    pub async fn rotate_data_key(&self, secret: MasterSecret) -> Result<u32> {
        self.vault.session.rotate_data_key(secret).await
    }

    pub async fn rotate_all(&self, timeout: Option<Duration>) -> Result<usize> {
        self.engine(timeout).rotate_all().await
    }

    pub async fn status(&self) -> SessionStatus {
        self.vault.session.status().await
    }

    /// Serve one request.
    ///
    /// Never fails: errors become error responses. `shutdown` only locks
    /// here; stopping the input loop is up to the caller.
    pub async fn handle(&self, request: Request) -> Response {
        let Request {
            id,
            timeout_ms,
            command,
        } = request;
        let op = command.name();
        let started = Instant::now();

        match self.execute(command, timeout_ms.map(Duration::from_millis)).await {
            Ok(result) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                if self.verbose {
                    info!(op, elapsed_ms, "Request completed");
                } else {
                    debug!(op, elapsed_ms, "Request completed");
                }
                Response::success(id, result)
            }
            Err(e) => {
                warn!(op, kind = %e.kind(), error = %e, "Request failed");
                Response::failure(id, &e)
            }
        }
    }

    async fn execute(&self, command: Command, timeout: Option<Duration>) -> Result<Outcome> {
        let result = match command {
            Command::Initialize { secret } => {
                let vault_id = self.initialize(master_secret(&secret)).await?;
                json!({ "vault_id": vault_id })
            }
            Command::Unlock { secret } => {
                self.unlock(master_secret(&secret)).await?;
                json!({ "state": "unlocked" })
            }
            Command::Lock => {
                self.lock().await?;
                json!({ "state": "locked" })
            }
            Command::Seal {
                key,
                value,
                encoding,
            } => {
                let id = SecretId::new(key)?;
                let plaintext = encoding.decode(&value)?;
                let record = self.seal(&id, &plaintext, timeout).await?;
                record_summary(&record)
            }
            Command::Open { key, encoding } => {
                let id = SecretId::new(key)?;
                let plaintext = self.open(&id, timeout).await?;
                let value = encoding.encode(&plaintext)?;
                return Ok(OpenedValue {
                    key: id,
                    value,
                    encoding,
                }
                .into());
            }
            Command::Delete { key } => {
                let id = SecretId::new(key)?;
                self.delete(&id, timeout).await?;
                json!({ "key": id })
            }
            Command::List => {
                let ids = self.list(timeout).await?;
                json!({ "keys": ids })
            }
            Command::ChangeMasterSecret { old, new } => {
                self.change_master_secret(master_secret(&old), master_secret(&new))
                    .await?;
                Value::Null
            }
            Command::Rotate { key } => {
                let id = SecretId::new(key)?;
                let record = self.rotate(&id, timeout).await?;
                record_summary(&record)
            }
            Command::RotateDataKey { secret } => {
                let epoch = self.rotate_data_key(master_secret(&secret)).await?;
                json!({ "active_epoch": epoch })
            }
            Command::RotateAll => {
                let rotated = self.rotate_all(timeout).await?;
                json!({ "rotated": rotated })
            }
            Command::Status => json!(self.status().await),
            Command::Shutdown => {
                self.lock().await?;
                json!({ "state": "locked" })
            }
        };
        Ok(result.into())
    }
}

fn master_secret(secret: &Zeroizing<String>) -> MasterSecret {
    MasterSecret::from(secret.as_str())
}

/// Record metadata safe to return to a client.
fn record_summary(record: &SecretRecord) -> Value {
    json!({
        "key": record.id,
        "version": record.version,
        "key_epoch": record.key_epoch,
        "updated_at": record.updated_at,
    })
}
