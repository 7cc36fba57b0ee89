use std::time::Duration;
use tokio::time::Instant;

/// Stored value plus the bookkeeping used for expiry and eviction.
#[derive(Debug, Clone)]
pub(crate) struct CacheEntry<V> {
    pub(crate) value: V,
    pub(crate) stored_at: Instant,
    pub(crate) last_accessed_at: Instant,
    pub(crate) access_count: u64,
    pub(crate) size: u64,
    pub(crate) ttl: Duration,
}

impl<V> CacheEntry<V> {
    pub(crate) const fn new(value: V, size: u64, ttl: Duration, now: Instant) -> Self {
        Self {
            value,
            stored_at: now,
            last_accessed_at: now,
            access_count: 0,
            size,
            ttl,
        }
    }

    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) > self.ttl
    }

    pub(crate) fn touch(&mut self, now: Instant) {
        self.access_count = self.access_count.saturating_add(1);
        self.last_accessed_at = now;
    }

    /// `access_count / (age_ms + recency_ms + 1)`.
    #[allow(clippy::cast_precision_loss)]
    pub(crate) fn priority_at(&self, now: Instant) -> f64 {
        let age = now.saturating_duration_since(self.stored_at).as_millis();
        let recency = now.saturating_duration_since(self.last_accessed_at).as_millis();
        self.access_count as f64 / (age as f64 + recency as f64 + 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_entry_has_zero_priority() {
        let now = Instant::now();
        let entry = CacheEntry::new("v", 1, Duration::from_secs(1), now);
        assert!(entry.priority_at(now + Duration::from_millis(5)).abs() < f64::EPSILON);
    }

    #[test]
    fn frequent_recent_access_outranks_stale_entry() {
        let start = Instant::now();
        let mut hot = CacheEntry::new("hot", 1, Duration::from_secs(60), start);
        let mut cold = CacheEntry::new("cold", 1, Duration::from_secs(60), start);
        cold.touch(start + Duration::from_millis(1));
        for step in 0..10 {
            hot.touch(start + Duration::from_millis(500 + step));
        }
        let now = start + Duration::from_millis(510);
        assert!(hot.priority_at(now) > cold.priority_at(now));
    }

    #[test]
    fn expiry_is_strictly_after_ttl() {
        let start = Instant::now();
        let entry = CacheEntry::new((), 1, Duration::from_millis(100), start);
        assert!(!entry.is_expired(start + Duration::from_millis(100)));
        assert!(entry.is_expired(start + Duration::from_millis(101)));
    }
}
