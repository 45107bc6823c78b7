//! Global admission control for model calls.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Stage};

/// Caps the number of in-flight model calls across all requests.
///
/// A caller waits at most `wait` for a permit, then gets
/// [`EngineError::Backpressure`]. Cloning shares the same permits.
#[derive(Debug, Clone)]
pub struct GenerationGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    wait: Duration,
}

impl GenerationGate {
    pub fn new(capacity: usize, wait: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            wait,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits currently free.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Take a permit, waiting at most the configured duration.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<OwnedSemaphorePermit, EngineError> {
        let started = Instant::now();
        let backpressure = || EngineError::Backpressure {
            capacity: self.capacity,
            waited: started.elapsed(),
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(EngineError::cancelled(Stage::Generation)),
            acquired = tokio::time::timeout(self.wait, Arc::clone(&self.semaphore).acquire_owned()) => {
                match acquired {
                    Ok(Ok(permit)) => Ok(permit),
                    // Timed out, or the semaphore was closed.
                    Ok(Err(_)) | Err(_) => {
                        tracing::warn!(capacity = self.capacity, "no generation slot available");
                        Err(backpressure())
                    }
                }
            }
        }
    }
}
