//! Application layer of contract-sync.
//!
//! This crate wires the cache and conflict resolver into the pieces an
//! embedding dashboard talks to: configuration, the request coordinator,
//! the realtime sync consumer and the cached fetch service.

/// TOML configuration discovered from the working directory.
pub mod config;
pub mod coordinator;
/// Owner of the shared cache and consumer.
pub mod engine;
pub mod error;
/// Read-through fetch service.
pub mod service;
pub mod sync;

// Re-exports for convenience
pub use config::{SyncConfig, SyncSettings};
pub use coordinator::{BatchCoordinator, CoordinatorConfig, RequestCoordinator, RetryPolicy};
pub use engine::SyncEngine;
pub use error::{BatchError, RequestError};
pub use service::CachedFetcher;
pub use sync::{SyncConsumer, SyncNotification, SyncOutcome};
