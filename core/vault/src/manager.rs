//! Vault manager for opening vaults over a named backend.

use std::sync::Arc;
use std::time::Duration;

use crate::config::SessionPolicy;
use crate::engine::VaultEngine;
use crate::session::SessionManager;
use mqvault_common::Result;
use mqvault_storage::{create_default_registry, RecordStore, StoreRegistry};

/// An opened vault: its session and an engine bound to it.
#[derive(Clone)]
pub struct Vault {
    pub session: Arc<SessionManager>,
    pub engine: VaultEngine,
}

impl Vault {
    /// Open a vault over an already resolved store.
    ///
    /// # Errors
    /// - `UnsupportedFormat` if the stored header has an unknown version
    /// - Storage failures
    pub async fn open(
        store: Arc<dyn RecordStore>,
        policy: SessionPolicy,
        io_timeout: Option<Duration>,
    ) -> Result<Self> {
        let session = SessionManager::open(store.clone(), policy, io_timeout).await?;
        let engine = VaultEngine::new(session.clone(), store, io_timeout);
        Ok(Self { session, engine })
    }
}

/// Vault manager for opening vaults by backend name.
pub struct VaultManager {
    registry: StoreRegistry,
}

impl VaultManager {
    /// Create a new vault manager with the built-in backends.
    pub fn new() -> Self {
        Self {
            registry: create_default_registry(),
        }
    }

    /// Create with custom registry.
    pub fn with_registry(registry: StoreRegistry) -> Self {
        Self { registry }
    }

    /// Get the store registry.
    pub fn registry(&self) -> &StoreRegistry {
        &self.registry
    }

    /// Get mutable store registry.
    pub fn registry_mut(&mut self) -> &mut StoreRegistry {
        &mut self.registry
    }

    /// Open the vault held by `backend`.
    ///
    /// # Preconditions
    /// - `backend` must be registered
    ///
    /// # Postconditions
    /// - Returns a vault that is `Locked`, or `Uninitialized` if the
    ///   backend holds no header yet
    ///
    /// # Errors
    /// - Backend not found or misconfigured
    /// - Header unreadable or of an unsupported version
    pub async fn open_vault(
        &self,
        backend: &str,
        store_config: serde_json::Value,
        policy: SessionPolicy,
        io_timeout: Option<Duration>,
    ) -> Result<Vault> {
        let store = self.registry.resolve(backend, store_config)?;
        Vault::open(store, policy, io_timeout).await
    }
}

impl Default for VaultManager {
    fn default() -> Self {
        Self::new()
    }
}
