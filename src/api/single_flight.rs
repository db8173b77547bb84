//! One in-flight evaluation per process.
//!
//! Concurrent `read_state` callers for the same process share a single
//! pipeline run through a cloneable shared future. The run itself executes
//! on a detached task, so a caller abandoning its wait never cancels work
//! other callers still benefit from. A caller whose target exceeds the
//! in-flight one waits for that run to settle, then leads a fresh run;
//! in-flight targets are never extended.

use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;

use crate::pipeline::{EvalError, EvalPipeline, ReadTarget, StateResult};

/// Errors cross the shared future by reference; every waiter sees the one
/// failure the run produced.
pub type SharedResult = Result<StateResult, Arc<EvalError>>;

type FlightFuture = Shared<BoxFuture<'static, SharedResult>>;

struct InFlight {
    target: ReadTarget,
    future: FlightFuture,
}

/// The `process id → in-flight run` table.
#[derive(Clone, Default)]
pub struct SingleFlight {
    pending: Arc<Mutex<FxHashMap<String, InFlight>>>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run (or join) the evaluation of `process_id` toward `target`.
    ///
    /// Joining callers may receive a result that ran past their own target;
    /// the read layer truncates against the store afterwards.
    pub async fn read_state(
        &self,
        pipeline: &EvalPipeline,
        process_id: &str,
        target: ReadTarget,
    ) -> SharedResult {
        loop {
            let existing = {
                let pending = self.pending.lock();
                pending
                    .get(process_id)
                    .map(|flight| (flight.target.clone(), flight.future.clone()))
            };

            match existing {
                Some((in_flight_target, future)) if in_flight_target.covers(&target) => {
                    return future.await;
                }
                Some((_, future)) => {
                    // Larger target: let the current run settle, then lead.
                    let _ = future.await;
                    continue;
                }
                None => {}
            }

            match self.try_lead(pipeline, process_id, target.clone()) {
                Some(future) => return future.await,
                // Someone else led between the check and the insert.
                None => continue,
            }
        }
    }

    /// Install a new flight unless one appeared concurrently.
    fn try_lead(
        &self,
        pipeline: &EvalPipeline,
        process_id: &str,
        target: ReadTarget,
    ) -> Option<FlightFuture> {
        let mut pending = self.pending.lock();
        if pending.contains_key(process_id) {
            return None;
        }

        let (tx, rx) = oneshot::channel::<SharedResult>();
        let future: FlightFuture = rx
            .map(|received| received.unwrap_or(Err(Arc::new(EvalError::Dropped))))
            .boxed()
            .shared();
        pending.insert(
            process_id.to_string(),
            InFlight {
                target: target.clone(),
                future: future.clone(),
            },
        );
        drop(pending);

        let pipeline = pipeline.clone();
        let table = self.pending.clone();
        let process_id = process_id.to_string();
        tokio::spawn(async move {
            let result = pipeline
                .read_state(&process_id, target)
                .await
                .map_err(Arc::new);
            table.lock().remove(&process_id);
            let _ = tx.send(result);
        });

        Some(future)
    }

    /// Observability view of the in-flight table.
    pub fn pending(&self) -> Vec<(String, String)> {
        self.pending
            .lock()
            .iter()
            .map(|(process_id, flight)| (process_id.clone(), flight.target.to_string()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}
