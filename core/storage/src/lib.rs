//! Record store abstraction for MQVault.
//!
//! This module provides a trait-based interface over persistence backends
//! (local directory, in-memory) and a registry for resolving them by name.
//!
//! # Design Principles
//! - No cryptographic knowledge: records are opaque bytes
//! - Atomic writes: an overwrite is never observable as a torn record
//! - Async operations with optional caller-specified time limits
//! - Unified error semantics: consistent error types across backends

pub mod local;
pub mod memory;
pub mod provider;
pub mod record;
pub mod registry;
pub mod timeout;

pub use local::LocalStore;
pub use memory::MemoryStore;
pub use provider::{IdStream, RecordStore};
pub use record::SecretRecord;
pub use registry::{create_default_registry, StoreFactory, StoreRegistry};
pub use timeout::bounded;
