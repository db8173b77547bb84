//! Admission gating in front of a worker pool.
//!
//! The queue is a counting semaphore sized to the pool's concurrency. The
//! submitted closure runs only after a permit is held, so the prep work it
//! performs (cloning a large memory buffer) never runs ahead of capacity.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Semaphore;

#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum AdmissionError {
    /// The bounded wait set is full; surfaced to callers as HTTP 429.
    #[error("admission queue full")]
    #[diagnostic(
        code(cueval::workers::overloaded),
        help("The dry-run pool is saturated; retry after a backoff.")
    )]
    Overloaded,

    #[error("worker pool shut down")]
    #[diagnostic(code(cueval::workers::closed))]
    Closed,
}

/// Concurrency-limited admission in front of a pool.
#[derive(Clone)]
pub struct AdmissionQueue {
    permits: Arc<Semaphore>,
    waiting: Arc<AtomicUsize>,
    /// Waiter ceiling; `None` means callers may queue without bound.
    max_waiting: Option<usize>,
}

impl AdmissionQueue {
    pub fn new(concurrency: usize, max_waiting: Option<usize>) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            waiting: Arc::new(AtomicUsize::new(0)),
            max_waiting,
        }
    }

    /// Callers parked waiting for a permit.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::Relaxed)
    }

    /// Run `task` once a slot is free.
    ///
    /// `task` is a thunk: admission happens first, then the thunk performs
    /// its prep and awaits the worker. When the wait set is already at the
    /// ceiling, the call is rejected instead of parked.
    pub async fn submit<F, Fut, T>(&self, task: F) -> Result<T, AdmissionError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                if let Some(max) = self.max_waiting {
                    if self.waiting.load(Ordering::Relaxed) >= max {
                        return Err(AdmissionError::Overloaded);
                    }
                }
                self.waiting.fetch_add(1, Ordering::Relaxed);
                let acquired = self.permits.clone().acquire_owned().await;
                self.waiting.fetch_sub(1, Ordering::Relaxed);
                acquired.map_err(|_| AdmissionError::Closed)?
            }
        };
        let out = task().await;
        drop(permit);
        Ok(out)
    }
}
