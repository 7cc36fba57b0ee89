use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use contract_sync_cache::CacheStore;
use tracing::debug;

use crate::coordinator::RequestCoordinator;
use crate::error::RequestError;

/// Read-through cache in front of the request coordinator.
///
/// A failed fetch never touches the cache, so a previously stored value
/// survives a remote outage.
pub struct CachedFetcher<T, E> {
    coordinator: RequestCoordinator<T, E>,
    cache: Arc<CacheStore<T>>,
}

impl<T, E> Clone for CachedFetcher<T, E> {
    fn clone(&self) -> Self {
        Self {
            coordinator: self.coordinator.clone(),
            cache: Arc::clone(&self.cache),
        }
    }
}

impl<T, E> CachedFetcher<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Display + Send + Sync + 'static,
{
    /// Combine a coordinator with the cache its results are stored in.
    pub const fn new(coordinator: RequestCoordinator<T, E>, cache: Arc<CacheStore<T>>) -> Self {
        Self { coordinator, cache }
    }

    /// Shared cache.
    pub const fn cache(&self) -> &Arc<CacheStore<T>> {
        &self.cache
    }

    /// Return the cached value for `key`, or fetch and store it.
    ///
    /// # Errors
    /// Returns the coordinated request's final error.
    pub async fn fetch<F, Fut>(&self, key: &str, operation: F) -> Result<T, RequestError<E>>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        if let Some(value) = self.cache.get(key) {
            debug!(key, "served from cache");
            return Ok(value);
        }
        self.refresh(key, operation).await
    }

    /// Fetch `key` regardless of the cache and store the result on success.
    ///
    /// # Errors
    /// Returns the coordinated request's final error; the cache is left as it was.
    pub async fn refresh<F, Fut>(&self, key: &str, operation: F) -> Result<T, RequestError<E>>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let value = self.coordinator.execute(key, operation).await?;
        self.cache.set(key, value.clone());
        Ok(value)
    }

    /// Drop one cached key.
    pub fn invalidate(&self, key: &str) -> bool {
        self.cache.delete(key)
    }

    /// Drop every cached key under `prefix`.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        self.cache.invalidate_prefix(prefix)
    }
}
