use super::{BoxFuture, CoordinatorConfig};
use crate::error::BatchError;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, warn};

type Slot<T, E> = oneshot::Sender<Result<T, BatchError<E>>>;
type Executor<P, T, E> = Box<dyn FnOnce(Vec<P>) -> BoxFuture<Result<Vec<T>, E>> + Send>;

struct BatchWindow<P, T, E> {
    generation: u64,
    members: Vec<(P, Slot<T, E>)>,
    executor: Executor<P, T, E>,
    timer: Option<JoinHandle<()>>,
}

struct Windows<P, T, E> {
    open: Mutex<HashMap<String, BatchWindow<P, T, E>>>,
    next_generation: AtomicU64,
    window: Duration,
    max_size: usize,
}

impl<P, T, E> Windows<P, T, E> {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, BatchWindow<P, T, E>>> {
        self.open.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Close the window for `key` if it is still the one the timer was started for.
    fn close_expired(&self, key: &str, generation: u64) -> Option<BatchWindow<P, T, E>> {
        let mut open = self.lock();
        if open.get(key).is_some_and(|w| w.generation == generation) {
            open.remove(key)
        } else {
            None
        }
    }
}

/// Coalesces calls sharing a batch key into one executor invocation.
pub struct BatchCoordinator<P, T, E> {
    inner: Arc<Windows<P, T, E>>,
}

impl<P, T, E> Clone for BatchCoordinator<P, T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P, T, E> fmt::Debug for BatchCoordinator<P, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchCoordinator")
            .field("open_windows", &self.inner.lock().len())
            .field("window", &self.inner.window)
            .field("max_size", &self.inner.max_size)
            .finish()
    }
}

impl<P, T, E> BatchCoordinator<P, T, E>
where
    P: Send + 'static,
    T: Send + 'static,
    E: Clone + fmt::Display + Send + 'static,
{
    /// Create a batcher using the configured window length and size limit.
    #[must_use]
    pub fn new(config: &CoordinatorConfig) -> Self {
        Self {
            inner: Arc::new(Windows {
                open: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
                window: config.batch_window(),
                max_size: config.max_batch_size.max(1),
            }),
        }
    }

    /// Add `params` to the window for `key` and wait for its share of the result.
    ///
    /// Only the executor passed by the call that opened the window is used.
    ///
    /// # Errors
    /// Every member of a window receives the same error when the executor
    /// fails or returns the wrong number of results.
    pub async fn batch<F, Fut>(
        &self,
        key: &str,
        params: P,
        executor: F,
    ) -> Result<T, BatchError<E>>
    where
        F: FnOnce(Vec<P>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Vec<T>, E>> + Send + 'static,
    {
        let (slot, result) = oneshot::channel();
        if let Some(full) = self.enqueue(key, params, slot, executor) {
            if let Some(timer) = &full.timer {
                timer.abort();
            }
            debug!(key, members = full.members.len(), "batch window full, flushing early");
            tokio::spawn(flush(key.to_owned(), full));
        }
        result.await.unwrap_or(Err(BatchError::Dropped))
    }

    fn enqueue<F, Fut>(
        &self,
        key: &str,
        params: P,
        slot: Slot<T, E>,
        executor: F,
    ) -> Option<BatchWindow<P, T, E>>
    where
        F: FnOnce(Vec<P>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Vec<T>, E>> + Send + 'static,
    {
        let mut open = self.inner.lock();
        let members = match open.entry(key.to_owned()) {
            Entry::Occupied(mut occupied) => {
                let window = occupied.get_mut();
                window.members.push((params, slot));
                window.members.len()
            }
            Entry::Vacant(vacant) => {
                let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                let executor: Executor<P, T, E> =
                    Box::new(move |params: Vec<P>| -> BoxFuture<Result<Vec<T>, E>> {
                        Box::pin(executor(params))
                    });
                let timer = (self.inner.max_size > 1).then(|| self.spawn_timer(key, generation));
                vacant.insert(BatchWindow {
                    generation,
                    members: vec![(params, slot)],
                    executor,
                    timer,
                });
                1
            }
        };
        if members >= self.inner.max_size {
            open.remove(key)
        } else {
            None
        }
    }

    fn spawn_timer(&self, key: &str, generation: u64) -> JoinHandle<()> {
        let windows = Arc::clone(&self.inner);
        let key = key.to_owned();
        let deadline = Instant::now() + self.inner.window;
        tokio::spawn(async move {
            time::sleep_until(deadline).await;
            if let Some(window) = windows.close_expired(&key, generation) {
                debug!(key, members = window.members.len(), "batch window deadline reached");
                flush(key, window).await;
            }
        })
    }

    /// Number of windows currently collecting members.
    #[must_use]
    pub fn open_windows(&self) -> usize {
        self.inner.lock().len()
    }
}

async fn flush<P, T, E>(key: String, window: BatchWindow<P, T, E>)
where
    E: Clone + fmt::Display,
{
    let (params, slots): (Vec<P>, Vec<Slot<T, E>>) = window.members.into_iter().unzip();
    let expected = params.len();

    let failure = match (window.executor)(params).await {
        Ok(results) if results.len() == expected => {
            for (slot, value) in slots.into_iter().zip(results) {
                // The caller may have stopped waiting.
                let _ = slot.send(Ok(value));
            }
            return;
        }
        Ok(results) => BatchError::LengthMismatch {
            expected,
            actual: results.len(),
        },
        Err(err) => BatchError::Executor(err),
    };

    warn!(key, members = expected, error = %failure, "batch rejected");
    for slot in slots {
        let _ = slot.send(Err(failure.clone()));
    }
}
