//! Application layer for MQVault.
//!
//! This module provides:
//! - `App`: opens the configured vault and serves line-delimited JSON
//!   requests on stdin/stdout
//! - `VaultService`: the typed facade every request goes through
//! - Configuration loading with defaults
//!
//! # Architecture
//! ```text
//! stdin → protocol::Request → VaultService → SessionManager / VaultEngine
//!                                                  ↓
//! stdout ← protocol::Response ←──────────── RecordStore
//! ```

pub mod app;
pub mod config;
pub mod protocol;
pub mod service;

pub use app::{serve, App};
pub use config::AppConfig;
pub use protocol::{Command, ErrorBody, OpenedValue, Outcome, Request, Response, ValueEncoding};
pub use service::VaultService;
