//! Durable copy of the cache used as a fallback while the backend is unreachable.

use crate::error::SnapshotError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;
use std::time::Duration;
use tempfile::NamedTempFile;
use time::OffsetDateTime;
use tracing::{debug, info};

/// One cached key/value pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry<V> {
    /// Cache key.
    pub key: String,
    /// Cached payload.
    pub value: V,
}

/// Serialized cache contents with their own expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineSnapshot<V> {
    #[serde(with = "time::serde::rfc3339")]
    /// Wall-clock time the snapshot was taken.
    pub saved_at: OffsetDateTime,
    /// Snapshot lifetime in milliseconds.
    pub ttl_ms: u64,
    /// Captured entries, sorted by key.
    pub entries: Vec<SnapshotEntry<V>>,
}

impl<V> OfflineSnapshot<V> {
    /// Wrap entries captured now.
    #[must_use]
    pub fn new(entries: Vec<SnapshotEntry<V>>, ttl: Duration) -> Self {
        Self {
            saved_at: OffsetDateTime::now_utc(),
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
            entries,
        }
    }

    /// Returns true once `now` is past `saved_at + ttl`.
    #[must_use]
    pub fn is_stale(&self, now: OffsetDateTime) -> bool {
        let ttl = time::Duration::milliseconds(i64::try_from(self.ttl_ms).unwrap_or(i64::MAX));
        now - self.saved_at > ttl
    }
}

impl<V: Serialize> OfflineSnapshot<V> {
    /// Write the snapshot as JSON, replacing `path` atomically.
    ///
    /// # Errors
    /// Returns an error when the file cannot be written or the payload cannot be encoded.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), SnapshotError> {
        let path = path.as_ref();
        let dir = path
            .parent()
            .ok_or_else(|| SnapshotError::InvalidPath(path.display().to_string()))?;
        let dir = if dir.as_os_str().is_empty() { Path::new(".") } else { dir };

        let body = serde_json::to_vec_pretty(self)?;
        let mut staged = NamedTempFile::new_in(dir)?;
        staged.write_all(&body)?;
        staged.persist(path).map_err(|err| err.error)?;
        info!(path = %path.display(), entries = self.entries.len(), "saved offline snapshot");
        Ok(())
    }
}

impl<V: DeserializeOwned> OfflineSnapshot<V> {
    /// Load a snapshot, discarding it when missing or stale.
    ///
    /// # Errors
    /// Returns an error when the file exists but cannot be read or decoded.
    pub fn load(path: impl AsRef<Path>, now: OffsetDateTime) -> Result<Option<Self>, SnapshotError> {
        let path = path.as_ref();
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let snapshot: Self = serde_json::from_slice(&raw)?;
        if snapshot.is_stale(now) {
            debug!(path = %path.display(), saved_at = %snapshot.saved_at, "discarding stale offline snapshot");
            return Ok(None);
        }
        Ok(Some(snapshot))
    }
}
