//! Bounded worker pool.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinSet};

/// Caps the number of tasks running at once.
///
/// Tasks are spawned immediately but wait for a permit before doing any
/// work, so at most `size` run concurrently across every set they are
/// spawned into.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    /// Creates a pool of `size` workers (at least one).
    #[must_use]
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Maximum number of concurrent workers.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Permits not currently held.
    #[must_use]
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Spawns `task` into `set`, gated by a pool permit.
    pub fn spawn<T, F>(&self, set: &mut JoinSet<T>, task: F) -> AbortHandle
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let permits = self.permits.clone();
        set.spawn(async move {
            // The semaphore is never closed.
            let _permit = permits.acquire_owned().await.ok();
            task.await
        })
    }
}
