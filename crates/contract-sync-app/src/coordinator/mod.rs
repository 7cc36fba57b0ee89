//! Deduplication, retry and batching around caller-supplied async operations.

mod batch;
mod dedup;
mod retry;

pub use batch::BatchCoordinator;
pub use dedup::RequestCoordinator;
pub use retry::{RetryPolicy, run_with_retry};

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Boxed, sendable future used where executors must be stored.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Timeouts, retry limits and windows for coordinated requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Hard timeout per attempt, in milliseconds.
    pub timeout_ms: u64,

    /// Total attempts per request (first try included).
    pub retries: u32,

    /// How long an in-flight request may be shared, in milliseconds.
    pub deduplication_window_ms: u64,

    /// How long a batch window collects members, in milliseconds.
    pub batch_window_ms: u64,

    /// Members that force a batch window to flush early.
    pub max_batch_size: usize,

    /// First retry delay, in milliseconds.
    pub backoff_base_ms: u64,

    /// Upper bound on any retry delay, in milliseconds.
    pub backoff_cap_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            retries: 3,
            deduplication_window_ms: 1_000,
            batch_window_ms: 50,
            max_batch_size: 10,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 10_000,
        }
    }
}

impl CoordinatorConfig {
    /// Per-attempt timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Dedup window.
    #[must_use]
    pub const fn deduplication_window(&self) -> Duration {
        Duration::from_millis(self.deduplication_window_ms)
    }

    /// Batch collection window.
    #[must_use]
    pub const fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    /// Retry policy derived from this configuration.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retries,
            timeout: self.timeout(),
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_cap: Duration::from_millis(self.backoff_cap_ms),
        }
    }
}
