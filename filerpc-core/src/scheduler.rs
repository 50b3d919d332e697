//! Bounded worker pool for handler execution.
//!
//! At most `max_workers` jobs run at once. [`WorkerPool::spawn`] waits for a free slot, so a
//! slow handler pushes back on discovery instead of growing an unbounded backlog.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{AcquireError, Semaphore};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: u32,
}

impl WorkerPool {
    /// A pool of `max_workers` slots (at least one).
    pub fn new(max_workers: usize) -> Self {
        let size = u32::try_from(max_workers.max(1)).unwrap_or(u32::MAX);
        Self {
            permits: Arc::new(Semaphore::new(size as usize)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size as usize
    }

    /// Jobs currently running.
    pub fn busy(&self) -> usize {
        self.size() - self.permits.available_permits()
    }

    /// Wait for a free worker, then run `job` on it.
    pub async fn spawn<F>(&self, job: F) -> Result<JoinHandle<()>, AcquireError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = self.permits.clone().acquire_owned().await?;
        Ok(tokio::spawn(async move {
            job.await;
            drop(permit);
        }))
    }

    /// Wait until every running job has finished.
    pub async fn drain(&self) {
        if let Ok(all) = self.permits.acquire_many(self.size).await {
            drop(all);
        }
    }
}
