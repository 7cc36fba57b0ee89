use std::fmt::Display;
use std::sync::Arc;

use contract_sync_cache::{CacheStore, SweeperHandle};
use contract_sync_core::Fields;
use tracing::info;

use crate::config::SyncConfig;
use crate::coordinator::{BatchCoordinator, RequestCoordinator};
use crate::sync::SyncConsumer;

/// Explicitly constructed owner of the shared cache, its expiry sweep and
/// the realtime consumer.
///
/// Dropping the engine stops the sweep.
#[derive(Debug)]
pub struct SyncEngine {
    config: SyncConfig,
    cache: Arc<CacheStore<Fields>>,
    consumer: Arc<SyncConsumer>,
    sweeper: SweeperHandle,
}

impl SyncEngine {
    /// Build the engine on the current tokio runtime.
    #[must_use]
    pub fn new(config: SyncConfig) -> Self {
        let cache = Arc::new(CacheStore::new(config.cache.clone()));
        let sweeper = cache.spawn_sweeper();
        let consumer = Arc::new(SyncConsumer::new(Arc::clone(&cache), &config.sync));
        info!(
            stream = %config.sync.stream,
            strategy = %config.sync.conflict_strategy,
            max_entries = config.cache.max_entries,
            "sync engine started"
        );
        Self {
            config,
            cache,
            consumer,
            sweeper,
        }
    }

    /// Effective configuration.
    #[must_use]
    pub const fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Cache shared by the consumer and any fetchers built on it.
    #[must_use]
    pub const fn cache(&self) -> &Arc<CacheStore<Fields>> {
        &self.cache
    }

    /// Realtime consumer writing into [`Self::cache`].
    #[must_use]
    pub const fn consumer(&self) -> &Arc<SyncConsumer> {
        &self.consumer
    }

    /// A request coordinator using the configured timeouts and retries.
    #[must_use]
    pub fn coordinator<T, E>(&self) -> RequestCoordinator<T, E>
    where
        T: Clone + Send + Sync + 'static,
        E: Clone + Display + Send + Sync + 'static,
    {
        RequestCoordinator::new(&self.config.coordinator)
    }

    /// A batcher using the configured window and size limit.
    #[must_use]
    pub fn batcher<P, T, E>(&self) -> BatchCoordinator<P, T, E>
    where
        P: Send + 'static,
        T: Send + 'static,
        E: Clone + Display + Send + 'static,
    {
        BatchCoordinator::new(&self.config.coordinator)
    }

    /// Stop background work. Cached data stays readable.
    pub fn shutdown(&self) {
        self.sweeper.shutdown();
    }
}
