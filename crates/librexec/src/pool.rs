use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Semaphore, TryAcquireError};
use tokio_util::task::TaskTracker;

use crate::error::PoolError;

/// Fixed-capacity set of workers. Admission is non-blocking: a job either
/// gets a worker immediately or is rejected. Clones share the same workers.
#[derive(Clone)]
pub struct WorkerPool {
    capacity: usize,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Result<Self, PoolError> {
        if capacity == 0 || capacity > Semaphore::MAX_PERMITS {
            return Err(PoolError::InvalidCapacity);
        }
        Ok(Self {
            capacity,
            permits: Arc::new(Semaphore::new(capacity)),
            tracker: TaskTracker::new(),
        })
    }

    /// Jobs currently holding a worker.
    #[cfg(test)]
    fn running(&self) -> usize {
        self.tracker.len()
    }

    pub fn submit<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .try_acquire_owned()
            .map_err(|err| match err {
                TryAcquireError::Closed => PoolError::Closed,
                TryAcquireError::NoPermits => PoolError::Saturated {
                    capacity: self.capacity,
                },
            })?;
        self.tracker.spawn(async move {
            let _permit = permit;
            job.await;
        });
        Ok(())
    }

    /// Refuse further submissions. Jobs already running are left alone.
    pub fn release(&self) {
        self.permits.close();
        self.tracker.close();
    }

    /// Wait for every job admitted so far. Only meaningful after `release`.
    pub async fn wait(&self) {
        self.tracker.wait().await;
    }
}
