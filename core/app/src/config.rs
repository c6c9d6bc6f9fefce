//! Application configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use mqvault_common::{Error, Result};
use mqvault_crypto::KdfParams;
use mqvault_vault::SessionPolicy;

/// Settings for one application run.
///
/// Every field has a default, so a config file only needs the keys it
/// changes. Command line flags are applied on top.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Log every request outcome, not only failures.
    pub verbose: bool,
    /// Store backend name, resolved through the store registry.
    pub backend: String,
    /// Vault directory for the `local` backend.
    pub vault_dir: PathBuf,
    /// Seconds of inactivity before autolock. 0 disables it.
    pub idle_timeout_secs: u64,
    /// Default limit for each store call, in milliseconds. 0 disables it.
    pub io_timeout_ms: u64,
    pub max_failed_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// KDF parameters for newly wrapped keys.
    pub kdf: KdfParams,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            backend: "local".to_string(),
            vault_dir: PathBuf::from("mqvault"),
            idle_timeout_secs: 300,
            io_timeout_ms: 5_000,
            max_failed_attempts: 5,
            base_backoff_ms: 1_000,
            max_backoff_ms: 300_000,
            kdf: KdfParams::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a JSON file.
    ///
    /// # Errors
    /// - File cannot be read
    /// - File is not valid configuration JSON
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| {
            Error::InvalidInput(format!("Invalid config file {}: {}", path.display(), e))
        })
    }

    /// Check the configuration for values that cannot work.
    ///
    /// # Errors
    /// - Empty backend name
    /// - Invalid KDF parameters
    /// - Backoff floor above its cap
    pub fn validate(&self) -> Result<()> {
        if self.backend.is_empty() {
            return Err(Error::InvalidInput("Backend name is empty".to_string()));
        }
        if self.base_backoff_ms > self.max_backoff_ms {
            return Err(Error::InvalidInput(
                "base_backoff_ms exceeds max_backoff_ms".to_string(),
            ));
        }
        self.kdf.validate()
    }

    /// Session policy derived from this configuration.
    pub fn session_policy(&self) -> SessionPolicy {
        SessionPolicy {
            idle_timeout: non_zero(Duration::from_secs(self.idle_timeout_secs)),
            max_failed_attempts: self.max_failed_attempts,
            base_backoff: Duration::from_millis(self.base_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            kdf: self.kdf.clone(),
        }
    }

    /// Default limit for store calls.
    pub fn io_timeout(&self) -> Option<Duration> {
        non_zero(Duration::from_millis(self.io_timeout_ms))
    }

    /// Backend configuration passed to the store registry.
    pub fn store_config(&self) -> serde_json::Value {
        serde_json::json!({ "root": self.vault_dir.to_string_lossy() })
    }
}

fn non_zero(duration: Duration) -> Option<Duration> {
    (!duration.is_zero()).then_some(duration)
}
