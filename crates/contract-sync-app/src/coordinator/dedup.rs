use super::CoordinatorConfig;
use super::retry::{RetryPolicy, run_with_retry};
use crate::error::RequestError;
use std::collections::HashMap;
use std::fmt::{self, Display};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

type Outcome<T, E> = Result<T, RequestError<E>>;

struct PendingRequest<T, E> {
    id: u64,
    started_at: Instant,
    result: watch::Receiver<Option<Outcome<T, E>>>,
}

struct Registry<T, E> {
    pending: Mutex<HashMap<String, PendingRequest<T, E>>>,
    next_id: AtomicU64,
    policy: RetryPolicy,
    window: Duration,
}

impl<T, E> Registry<T, E> {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingRequest<T, E>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop the registry slot, unless a newer request already replaced it.
    fn settle(&self, key: &str, id: u64) {
        let mut pending = self.lock();
        if pending.get(key).is_some_and(|slot| slot.id == id) {
            pending.remove(key);
        }
    }
}

/// At-most-one in-flight execution per logical request key.
///
/// Concurrent callers using the same key within the dedup window attach to
/// the running operation and all observe its outcome.
pub struct RequestCoordinator<T, E> {
    inner: Arc<Registry<T, E>>,
}

impl<T, E> Clone for RequestCoordinator<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, E> fmt::Debug for RequestCoordinator<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestCoordinator")
            .field("pending", &self.inner.lock().len())
            .field("policy", &self.inner.policy)
            .field("window", &self.inner.window)
            .finish()
    }
}

impl<T, E> RequestCoordinator<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Display + Send + Sync + 'static,
{
    /// Create a coordinator from configuration.
    #[must_use]
    pub fn new(config: &CoordinatorConfig) -> Self {
        Self {
            inner: Arc::new(Registry {
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                policy: config.retry_policy(),
                window: config.deduplication_window(),
            }),
        }
    }

    /// Execute `operation` under `key`, sharing any in-flight execution.
    ///
    /// # Errors
    /// Returns the operation's final error after retries, unchanged.
    pub async fn execute<F, Fut>(&self, key: &str, operation: F) -> Outcome<T, E>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.execute_with(key, operation, false).await
    }

    /// Execute `operation`, optionally bypassing deduplication.
    ///
    /// # Errors
    /// Returns the operation's final error after retries, unchanged.
    pub async fn execute_with<F, Fut>(
        &self,
        key: &str,
        operation: F,
        skip_dedup: bool,
    ) -> Outcome<T, E>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        if skip_dedup {
            return run_with_retry(&self.inner.policy, key, &operation).await;
        }
        let receiver = self.attach_or_start(key, operation);
        wait_for_outcome(receiver).await
    }

    fn attach_or_start<F, Fut>(
        &self,
        key: &str,
        operation: F,
    ) -> watch::Receiver<Option<Outcome<T, E>>>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let now = Instant::now();
        let mut pending = self.inner.lock();
        if let Some(existing) = pending.get(key) {
            if now.saturating_duration_since(existing.started_at) <= self.inner.window {
                debug!(key, "attaching to in-flight request");
                return existing.result.clone();
            }
            debug!(key, "in-flight request outlived dedup window, starting fresh");
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = watch::channel(None);
        pending.insert(
            key.to_owned(),
            PendingRequest {
                id,
                started_at: now,
                result: receiver.clone(),
            },
        );
        drop(pending);

        let registry = Arc::clone(&self.inner);
        let key = key.to_owned();
        tokio::spawn(async move {
            let outcome = run_with_retry(&registry.policy, &key, &operation).await;
            registry.settle(&key, id);
            sender.send_replace(Some(outcome));
        });
        receiver
    }

    /// Number of requests currently registered as in flight.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.lock().len()
    }

    /// Returns true while a request for `key` is registered.
    #[must_use]
    pub fn is_pending(&self, key: &str) -> bool {
        self.inner.lock().contains_key(key)
    }
}

async fn wait_for_outcome<T: Clone, E: Clone>(
    mut receiver: watch::Receiver<Option<Outcome<T, E>>>,
) -> Outcome<T, E> {
    match receiver.wait_for(Option::is_some).await {
        Ok(settled) => settled.clone().unwrap_or(Err(RequestError::Aborted)),
        Err(_) => Err(RequestError::Aborted),
    }
}
