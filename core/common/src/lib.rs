//! Common utilities and types shared across MQVault modules.
//!
//! This module provides the error taxonomy, identifier types, and serde
//! helpers that every other crate in the workspace builds on.

pub mod encoding;
pub mod error;
pub mod types;

pub use error::{Error, ErrorKind, Result};
pub use types::{SecretId, VaultId, MAX_SECRET_ID_LEN};
