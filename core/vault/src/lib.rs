//! Vault engine and session lifecycle for MQVault.
//!
//! This module provides:
//! - The session manager owning vault state and the unwrapped key ring
//! - Idle autolock and unlock rate limiting
//! - The record engine sealing and opening secrets through a store
//! - The persisted vault header
//!
//! # Architecture
//! The session is the single serialization point for state. The engine
//! holds no keys and borrows the key ring from the session for each
//! cryptographic step, so locking always wins over a pending operation.

pub mod config;
pub mod engine;
pub mod manager;
pub mod session;

pub use config::{SessionPolicy, VaultHeader, FORMAT_VERSION};
pub use engine::VaultEngine;
pub use manager::{Vault, VaultManager};
pub use session::{SessionManager, SessionStatus, VaultState};
