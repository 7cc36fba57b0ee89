//! Cache limits.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Size, count and lifetime limits for one cache namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Aggregate byte budget across all entries.
    pub max_total_bytes: u64,

    /// Maximum number of live entries.
    pub max_entries: usize,

    /// Lifetime applied by `set` when no explicit TTL is given, in milliseconds.
    pub default_ttl_ms: u64,

    /// Period of the background expiry sweep, in milliseconds.
    pub cleanup_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_total_bytes: 50 * 1024 * 1024,
            max_entries: 1000,
            default_ttl_ms: 5 * 60 * 1000,
            cleanup_interval_ms: 60 * 1000,
        }
    }
}

impl CacheConfig {
    /// Default entry lifetime.
    #[must_use]
    pub const fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    /// Sweep period.
    #[must_use]
    pub const fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    /// Largest single entry accepted: 10% of the byte budget.
    #[must_use]
    pub const fn max_entry_bytes(&self) -> u64 {
        self.max_total_bytes / 10
    }
}
