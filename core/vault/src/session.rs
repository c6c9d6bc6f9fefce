//! Vault session management.
//!
//! The session owns the vault state and the unwrapped key ring. Keys are
//! dropped, and therefore zeroized, on lock, on idle timeout, and when the
//! session itself is dropped.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{SessionPolicy, VaultHeader};
use mqvault_common::{Error, Result, VaultId};
use mqvault_crypto::{self as crypto, KeyRing, MasterSecret};
use mqvault_storage::{bounded, RecordStore};

/// Lifecycle state of a vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VaultState {
    /// No header exists yet.
    Uninitialized,
    /// Header exists, keys are not in memory.
    Locked,
    /// Keys are in memory and records can be sealed and opened.
    Unlocked,
}

impl fmt::Display for VaultState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VaultState::Uninitialized => "uninitialized",
            VaultState::Locked => "locked",
            VaultState::Unlocked => "unlocked",
        };
        f.write_str(name)
    }
}

/// Snapshot of the session reported by `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub state: VaultState,
    pub vault_id: Option<VaultId>,
    pub active_epoch: Option<u32>,
    pub key_epochs: Vec<u32>,
    pub failed_attempts: u32,
}

struct Inner {
    header: Option<VaultHeader>,
    ring: Option<KeyRing>,
    failed_attempts: u32,
    last_failure: Option<Instant>,
    /// Bumped on every unlock so a stale autolock task can tell it has
    /// been superseded.
    generation: u64,
    /// Watcher for the current generation. Swapped only under the write
    /// guard, together with `generation`.
    autolock: Option<JoinHandle<()>>,
}

impl Inner {
    fn state(&self) -> VaultState {
        match (&self.header, &self.ring) {
            (None, _) => VaultState::Uninitialized,
            (Some(_), None) => VaultState::Locked,
            (Some(_), Some(_)) => VaultState::Unlocked,
        }
    }

    fn header(&self) -> Result<&VaultHeader> {
        self.header.as_ref().ok_or(Error::NotInitialized)
    }
}

/// Owner of vault state and the single serialization point for it.
///
/// Record crypto runs under a read guard via [`SessionManager::with_unlocked`];
/// every state transition takes the write guard. A lock therefore waits
/// for in-flight crypto, and crypto never sees a half-dropped key ring.
pub struct SessionManager {
    me: Weak<SessionManager>,
    store: Arc<dyn RecordStore>,
    policy: SessionPolicy,
    io_timeout: Option<Duration>,
    inner: RwLock<Inner>,
    epoch_start: Instant,
    /// Milliseconds since `epoch_start` at the last unlocked operation.
    last_activity: AtomicU64,
}

impl SessionManager {
    /// Open a session over `store`.
    ///
    /// # Postconditions
    /// - State is `Locked` if the store holds a header, `Uninitialized`
    ///   otherwise
    ///
    /// # Errors
    /// - `UnsupportedFormat` if the stored header has an unknown version
    /// - Storage failures, including `Timeout`
    pub async fn open(
        store: Arc<dyn RecordStore>,
        policy: SessionPolicy,
        io_timeout: Option<Duration>,
    ) -> Result<Arc<Self>> {
        let header = match bounded(io_timeout, store.read_header()).await? {
            Some(bytes) => Some(VaultHeader::from_bytes(&bytes)?),
            None => None,
        };

        match &header {
            Some(h) => info!(vault_id = %h.vault_id, backend = store.name(), "Opened vault"),
            None => info!(backend = store.name(), "No vault header found"),
        }

        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            store,
            policy,
            io_timeout,
            inner: RwLock::new(Inner {
                header,
                ring: None,
                failed_attempts: 0,
                last_failure: None,
                generation: 0,
                autolock: None,
            }),
            epoch_start: Instant::now(),
            last_activity: AtomicU64::new(0),
        }))
    }

    /// Get the session policy.
    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> VaultState {
        self.inner.read().await.state()
    }

    /// Create a new vault protected by `secret`.
    ///
    /// # Postconditions
    /// - A header with one wrapped data key is persisted
    /// - State is `Locked`
    ///
    /// # Errors
    /// - `AlreadyInitialized` if a header already exists
    /// - `WeakSecret` if the secret fails the strength check
    pub async fn initialize(&self, secret: MasterSecret) -> Result<VaultId> {
        let mut inner = self.inner.write().await;
        if inner.header.is_some() {
            return Err(Error::AlreadyInitialized);
        }

        let vault_id = VaultId::generate();
        let params = self.policy.kdf.clone();
        let id = vault_id.clone();
        let wrapped = run_blocking(move || crypto::initialize(&secret, &params, &id)).await?;

        let header = VaultHeader::new(vault_id.clone(), wrapped);
        self.persist_header(&header).await?;
        inner.header = Some(header);

        info!(vault_id = %vault_id, "Vault initialized");
        Ok(vault_id)
    }

    /// Unlock the vault with `secret`.
    ///
    /// When already unlocked the secret is still verified and the idle
    /// timer restarts.
    ///
    /// # Errors
    /// - `NotInitialized` if there is no vault
    /// - `TooManyAttempts` while a backoff is in effect; no key derivation
    ///   is attempted
    /// - `Authentication` on a wrong secret; counts as a failed attempt
    pub async fn unlock(&self, secret: MasterSecret) -> Result<()> {
        let mut inner = self.inner.write().await;
        let header = inner.header()?.clone();
        self.check_backoff(&inner)?;

        let vault_id = header.vault_id.clone();
        let set = header.wrapped.clone();
        let unwrapped = run_blocking(move || crypto::unwrap(&secret, &set, &vault_id)).await;
        let ring = self.track_attempt(&mut inner, unwrapped)?;

        let state = inner.state();
        if state != VaultState::Unlocked {
            inner.ring = Some(ring);
            info!(vault_id = %header.vault_id, epoch = header.wrapped.active_epoch, "Vault unlocked");
        } else {
            debug!(vault_id = %header.vault_id, "Unlock while unlocked, idle timer reset");
        }

        inner.generation += 1;
        self.touch();
        self.schedule_autolock(&mut inner);
        Ok(())
    }

    /// Lock the vault, dropping all keys.
    ///
    /// Idempotent: locking a locked or uninitialized vault succeeds.
    pub async fn lock(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        self.lock_inner(&mut inner, "requested");
        if let Some(handle) = inner.autolock.take() {
            handle.abort();
        }
        Ok(())
    }

    /// Re-protect the data keys under a new master secret.
    ///
    /// Works locked or unlocked and leaves the state unchanged. Records are
    /// not touched. The new key set uses the policy's KDF parameters.
    ///
    /// # Errors
    /// - `NotInitialized` if there is no vault
    /// - `TooManyAttempts` while a backoff is in effect
    /// - `Authentication` if `old` is wrong; counts as a failed attempt
    /// - `WeakSecret` if `new` fails the strength check
    /// - `InvalidInput` if `new` equals `old`
    pub async fn change_master_secret(&self, old: MasterSecret, new: MasterSecret) -> Result<()> {
        let mut inner = self.inner.write().await;
        let header = inner.header()?.clone();
        self.check_backoff(&inner)?;

        if bool::from(old.as_bytes().ct_eq(new.as_bytes())) {
            return Err(Error::InvalidInput(
                "New secret must differ from the current one".to_string(),
            ));
        }

        let vault_id = header.vault_id.clone();
        let set = header.wrapped.clone();
        let params = self.policy.kdf.clone();
        let rewrapped = run_blocking(move || crypto::rewrap(&old, &new, &set, &params, &vault_id))
            .await;
        let rewrapped = self.track_attempt(&mut inner, rewrapped)?;

        let updated = header.with_keys(rewrapped);
        self.persist_header(&updated).await?;
        inner.header = Some(updated);

        info!(vault_id = %header.vault_id, "Master secret changed");
        Ok(())
    }

    /// Add a new active data key.
    ///
    /// Earlier keys stay available so existing records still open; new
    /// seals use the new epoch.
    ///
    /// # Errors
    /// - `Locked` unless unlocked
    /// - `Authentication` if `secret` is wrong; counts as a failed attempt
    pub async fn rotate_data_key(&self, secret: MasterSecret) -> Result<u32> {
        let mut inner = self.inner.write().await;
        let header = inner.header()?.clone();
        if inner.ring.is_none() {
            return Err(Error::Locked);
        }
        self.check_backoff(&inner)?;

        let vault_id = header.vault_id.clone();
        let set = header.wrapped.clone();
        let added = run_blocking(move || crypto::add_epoch(&secret, &set, &vault_id)).await;
        let (wrapped, ring) = self.track_attempt(&mut inner, added)?;

        let epoch = ring.active_epoch();
        let updated = header.with_keys(wrapped);
        self.persist_header(&updated).await?;
        inner.header = Some(updated);
        inner.ring = Some(ring);
        self.touch();

        info!(vault_id = %header.vault_id, epoch, "Data key rotated");
        Ok(epoch)
    }

    /// Report the current state.
    pub async fn status(&self) -> SessionStatus {
        let inner = self.inner.read().await;
        let header = inner.header.as_ref();
        SessionStatus {
            state: inner.state(),
            vault_id: header.map(|h| h.vault_id.clone()),
            active_epoch: header.map(|h| h.wrapped.active_epoch),
            key_epochs: header
                .map(|h| h.wrapped.keys.iter().map(|k| k.epoch).collect())
                .unwrap_or_default(),
            failed_attempts: inner.failed_attempts,
        }
    }

    /// Run `f` with the unlocked key ring.
    ///
    /// Counts as activity for the idle timer.
    ///
    /// # Errors
    /// - `Locked` unless unlocked
    /// - Whatever `f` returns
    pub async fn with_unlocked<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&KeyRing) -> Result<T>,
    {
        let inner = self.inner.read().await;
        let ring = inner.ring.as_ref().ok_or(Error::Locked)?;
        self.touch();
        f(ring)
    }

    /// Fail with `Locked` unless unlocked.
    ///
    /// Counts as activity for the idle timer.
    pub async fn ensure_unlocked(&self) -> Result<()> {
        self.with_unlocked(|_| Ok(())).await
    }

    fn touch(&self) {
        let now = self.epoch_start.elapsed().as_millis() as u64;
        self.last_activity.fetch_max(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity.load(Ordering::Relaxed));
        self.epoch_start.elapsed().saturating_sub(last)
    }

    fn check_backoff(&self, inner: &Inner) -> Result<()> {
        let (Some(delay), Some(since)) = (
            self.policy.backoff_after(inner.failed_attempts),
            inner.last_failure,
        ) else {
            return Ok(());
        };

        let elapsed = since.elapsed();
        if elapsed < delay {
            return Err(Error::TooManyAttempts {
                retry_after: delay - elapsed,
            });
        }
        Ok(())
    }

    /// Update the failure counter from the outcome of a secret check.
    fn track_attempt<T>(&self, inner: &mut Inner, outcome: Result<T>) -> Result<T> {
        match outcome {
            Ok(value) => {
                inner.failed_attempts = 0;
                inner.last_failure = None;
                Ok(value)
            }
            Err(Error::Authentication) => {
                inner.failed_attempts = inner.failed_attempts.saturating_add(1);
                inner.last_failure = Some(Instant::now());
                warn!(failed_attempts = inner.failed_attempts, "Master secret rejected");
                Err(Error::Authentication)
            }
            Err(e) => Err(e),
        }
    }

    async fn persist_header(&self, header: &VaultHeader) -> Result<()> {
        let bytes = header.to_bytes()?;
        bounded(self.io_timeout, self.store.write_header(bytes)).await
    }

    fn lock_inner(&self, inner: &mut Inner, reason: &str) {
        if inner.ring.take().is_some() {
            info!(reason, "Vault locked");
        }
    }

    /// Replace the idle watcher with one bound to the current generation.
    fn schedule_autolock(&self, inner: &mut Inner) {
        if let Some(previous) = inner.autolock.take() {
            previous.abort();
        }
        let Some(idle) = self.policy.idle_timeout else {
            return;
        };

        let generation = inner.generation;

        let me = self.me.clone();
        let handle = tokio::spawn(async move {
            loop {
                let wait = match me.upgrade() {
                    Some(session) => idle.saturating_sub(session.idle_for()),
                    None => return,
                };
                tokio::time::sleep(wait).await;

                let Some(session) = me.upgrade() else {
                    return;
                };
                if !session.lock_if_idle(generation, idle).await {
                    return;
                }
            }
        });
        inner.autolock = Some(handle);
    }

    /// Lock if still idle. Returns whether the watcher should keep going.
    async fn lock_if_idle(&self, generation: u64, idle: Duration) -> bool {
        let mut inner = self.inner.write().await;
        if inner.generation != generation || inner.ring.is_none() {
            return false;
        }
        if self.idle_for() < idle {
            return true;
        }
        self.lock_inner(&mut inner, "idle timeout");
        false
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Some(handle) = self.inner.get_mut().autolock.take() {
            handle.abort();
        }
    }
}

/// Run CPU-bound key derivation off the async workers.
async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Crypto(format!("Key derivation task failed: {}", e)))?
}
