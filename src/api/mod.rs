//! The read surface of the Compute Unit.
//!
//! [`Cu`] owns the wired dependency graph and exposes the operations a
//! transport layer serves: `read_state` (single-flight), `read_result`,
//! `read_results`, `read_cron_results`, `dry_run`, `checkpoint_all`,
//! `healthcheck`, `stats`, and `metrics`. Everything here is pure
//! coordination; the evaluation semantics live in [`crate::pipeline`].

mod single_flight;

pub use single_flight::SingleFlight;

use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::StreamExt;
use futures_util::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::instrument;

use crate::cache::{CacheUsage, ProcessMemoryCache};
use crate::checkpoint::{
    CheckpointFiles, CheckpointPolicy, CheckpointStore, HttpCheckpointNetwork, MemoryTarget,
    Wallet,
};
use crate::config::CuConfig;
use crate::locator::{BatchedLocator, GatewayLocator};
use crate::metrics::{CuMetrics, MetricsError};
use crate::model::Evaluation;
use crate::model::ScheduledMessage;
use crate::ordinate::{Ordinate, SortOrder};
use crate::pipeline::{
    AccessPolicy, CuDeps, EvalError, EvalPipeline, ReadTarget, StateResult,
};
use crate::store::{EvaluationQuery, SqliteStore, StoreError};
use crate::su::HttpSchedulerUnit;
use crate::wasm::{ModuleLoader, ModulePolicy, WasmRuntime};
use crate::workers::{AdmissionQueue, WorkerInit, WorkerPool, WorkerSplit};

/// `checkpoint_all` walks the cache snapshot with this much parallelism.
const CHECKPOINT_ALL_PARALLELISM: usize = 10;

#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum InitError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error("directory setup failed: {0}")]
    #[diagnostic(code(cueval::init::io))]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Metrics(#[from] MetricsError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Wallet(#[from] crate::checkpoint::BundleError),
}

/// Wallet identity report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Healthcheck {
    pub address: Option<String>,
}

/// Occupancy of one pool and its admission queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolOccupancy {
    pub active: usize,
    pub idle: usize,
    pub pending_tasks: usize,
}

/// Snapshot returned by [`Cu::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct CuStats {
    pub primary: PoolOccupancy,
    pub dry_run: PoolOccupancy,
    /// Resident set size of this process, when the platform exposes it.
    pub process_memory_bytes: u64,
    pub cache_entries: usize,
    pub cache_resident_bytes: usize,
    pub cache_spilled: usize,
}

/// One in-flight read, for observability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingReadState {
    pub process_id: String,
    pub target: String,
}

/// The Compute Unit facade.
pub struct Cu {
    deps: Arc<CuDeps>,
    pipeline: EvalPipeline,
    flights: SingleFlight,
    checkpoint_all_flight: Arc<Mutex<Option<Shared<BoxFuture<'static, ()>>>>>,
    ttl_sweeper: tokio::task::JoinHandle<()>,
}

impl Drop for Cu {
    fn drop(&mut self) {
        self.ttl_sweeper.abort();
    }
}

impl Cu {
    /// Wire the full dependency graph from configuration.
    ///
    /// The WASM engine arrives through the `runtime` seam; everything else
    /// (store, caches, clients, pools) is constructed here.
    pub async fn new(cfg: CuConfig, runtime: Arc<dyn WasmRuntime>) -> Result<Self, InitError> {
        let metrics = CuMetrics::new()?;
        let store = SqliteStore::connect(&cfg.db_url).await?;
        let files = Arc::new(CheckpointFiles::new(
            &cfg.memory_spill_dir,
            &cfg.checkpoint_file_dir,
        )?);
        let cache = ProcessMemoryCache::new(
            cfg.memory_cache_max_bytes,
            cfg.memory_cache_ttl,
            files.clone(),
        );
        let wallet = match &cfg.wallet_path {
            Some(path) => Some(Arc::new(Wallet::load(path)?)),
            None => None,
        };
        let network = Arc::new(HttpCheckpointNetwork::new(
            cfg.checkpoint_gateway_url(),
            &cfg.arweave_url,
            &cfg.uploader_url,
        ));
        let checkpoints = Arc::new(CheckpointStore::new(
            files,
            network,
            wallet,
            store.clone(),
            CheckpointPolicy::from_config(&cfg),
            metrics.clone(),
        ));
        let modules = Arc::new(ModuleLoader::new(
            &cfg.arweave_url,
            &cfg.graphql_url,
            &cfg.wasm_binary_dir,
            cfg.module_cache_max_size,
        )?);
        let locator = BatchedLocator::new(Arc::new(GatewayLocator::new(&cfg.graphql_url)));

        let split = WorkerSplit::from_config(&cfg);
        let init = WorkerInit::from_config(&cfg);
        let primary_pool = Arc::new(WorkerPool::new(
            "primary",
            split.primary,
            runtime.clone(),
            init.clone(),
        ));
        let dry_run_pool = Arc::new(WorkerPool::new("dry-run", split.dry_run, runtime, init));

        let deps = Arc::new(CuDeps {
            store,
            cache,
            checkpoints,
            modules,
            su: Arc::new(HttpSchedulerUnit::new()),
            locator,
            primary_pool,
            primary_queue: AdmissionQueue::new(split.primary, None),
            dry_run_pool,
            dry_run_queue: AdmissionQueue::new(split.dry_run, Some(cfg.dry_run_max_queue)),
            module_policy: ModulePolicy::from_config(&cfg),
            access: AccessPolicy::from_config(&cfg),
            metrics,
            eager_checkpoint_gas_threshold: cfg.eager_checkpoint_gas_threshold,
        });
        Ok(Self::from_deps(deps))
    }

    /// Assemble from pre-wired dependencies (tests, embedded hosts).
    pub fn from_deps(deps: Arc<CuDeps>) -> Self {
        let pipeline = EvalPipeline::new(deps.clone());
        let ttl_sweeper = deps.cache.spawn_ttl_sweeper();
        Self {
            deps,
            pipeline,
            flights: SingleFlight::new(),
            checkpoint_all_flight: Arc::new(Mutex::new(None)),
            ttl_sweeper,
        }
    }

    pub fn deps(&self) -> &Arc<CuDeps> {
        &self.deps
    }

    /// State of a process after replaying to `target`.
    ///
    /// Concurrent callers for one process share a single pipeline run;
    /// callers with a narrower target than the shared run receive a view
    /// truncated against the store.
    #[instrument(skip(self, target), fields(target = %target), err)]
    pub async fn read_state(
        &self,
        process_id: &str,
        target: ReadTarget,
    ) -> Result<StateResult, EvalError> {
        let shared = self
            .flights
            .read_state(&self.pipeline, process_id, target.clone())
            .await;
        match shared {
            Ok(state) => self.truncate_to(process_id, &target, state).await,
            Err(err) => Err(unshare(err)),
        }
    }

    /// The in-flight evaluation table, one entry per process at most.
    pub fn pending_read_states(&self) -> Vec<PendingReadState> {
        self.flights
            .pending()
            .into_iter()
            .map(|(process_id, target)| PendingReadState { process_id, target })
            .collect()
    }

    /// The evaluation of one message, advancing state if needed.
    #[instrument(skip(self), err)]
    pub async fn read_result(
        &self,
        process_id: &str,
        message_id: &str,
    ) -> Result<Evaluation, EvalError> {
        self.deps.access.check_process_id(process_id)?;
        let location = self.deps.locator.locate(process_id).await?;
        let meta = self
            .deps
            .su
            .load_message_meta(&location.su_url, process_id, message_id)
            .await?;
        if meta.process_id != process_id {
            return Err(EvalError::NotFound {
                what: format!("message {message_id} in process {process_id}"),
            });
        }

        self.read_state(process_id, ReadTarget::Ordinate(meta.ordinate.clone()))
            .await?;
        self.deps
            .store
            .find_evaluation(process_id, &meta.ordinate, None)
            .await?
            .ok_or_else(|| EvalError::NotFound {
                what: format!("evaluation of message {message_id}"),
            })
    }

    /// Pure query over persisted evaluations; never triggers evaluation.
    pub async fn read_results(
        &self,
        process_id: &str,
        from: Option<Ordinate>,
        to: Option<Ordinate>,
        limit: Option<u32>,
        sort: SortOrder,
    ) -> Result<Vec<Evaluation>, EvalError> {
        self.deps.access.check_process_id(process_id)?;
        let query = EvaluationQuery {
            from,
            to,
            only_cron: false,
            limit,
            sort,
        };
        Ok(self.deps.store.find_evaluations(process_id, &query).await?)
    }

    /// Pure query over persisted cron evaluations.
    pub async fn read_cron_results(
        &self,
        process_id: &str,
        from: Option<Ordinate>,
        to: Option<Ordinate>,
        limit: Option<u32>,
    ) -> Result<Vec<Evaluation>, EvalError> {
        self.deps.access.check_process_id(process_id)?;
        let query = EvaluationQuery {
            from,
            to,
            only_cron: true,
            limit,
            sort: SortOrder::Ascending,
        };
        Ok(self.deps.store.find_evaluations(process_id, &query).await?)
    }

    /// Speculative evaluation of `overlay` at the state of `message_id`
    /// (or the latest state). Persists nothing; saturation of the dry-run
    /// pool returns the overload error.
    #[instrument(skip(self, overlay), err)]
    pub async fn dry_run(
        &self,
        process_id: &str,
        message_id: Option<&str>,
        overlay: ScheduledMessage,
    ) -> Result<crate::model::EvalOutput, EvalError> {
        let target = match message_id {
            Some(message_id) => {
                let location = self.deps.locator.locate(process_id).await?;
                let meta = self
                    .deps
                    .su
                    .load_message_meta(&location.su_url, process_id, message_id)
                    .await?;
                self.read_state(process_id, ReadTarget::Ordinate(meta.ordinate.clone()))
                    .await?;
                MemoryTarget::at_ordinate(meta.ordinate)
            }
            None => {
                self.read_state(process_id, ReadTarget::Latest).await?;
                MemoryTarget::latest()
            }
        };
        self.pipeline.dry_run(process_id, &target, overlay).await
    }

    /// Checkpoint every cached process memory, with bounded parallelism.
    ///
    /// Individual failures are swallowed by the save pipeline; the overall
    /// call always completes. Concurrent invocations share one run.
    #[instrument(skip(self))]
    pub async fn checkpoint_all(&self) {
        let flight = {
            let mut slot = self.checkpoint_all_flight.lock();
            if let Some(flight) = slot.as_ref() {
                flight.clone()
            } else {
                let deps = self.deps.clone();
                let slot_handle = self.checkpoint_all_flight.clone();
                let (tx, rx) = tokio::sync::oneshot::channel::<()>();
                tokio::spawn(async move {
                    let entries = deps.cache.snapshot();
                    let total = entries.len();
                    futures_util::stream::iter(entries)
                        .for_each_concurrent(CHECKPOINT_ALL_PARALLELISM, |(_, memory)| {
                            let checkpoints = deps.checkpoints.clone();
                            async move {
                                checkpoints.save_checkpoint(memory).await;
                            }
                        })
                        .await;
                    tracing::info!(total, "bulk checkpoint pass complete");
                    slot_handle.lock().take();
                    let _ = tx.send(());
                });
                let flight: Shared<BoxFuture<'static, ()>> =
                    rx.map(|_| ()).boxed().shared();
                *slot = Some(flight.clone());
                flight
            }
        };
        flight.await;
    }

    pub fn healthcheck(&self) -> Healthcheck {
        Healthcheck {
            address: self
                .deps
                .checkpoints
                .wallet()
                .map(|wallet| wallet.address().to_string()),
        }
    }

    pub fn stats(&self) -> CuStats {
        let primary = self.deps.primary_pool.stats();
        let dry_run = self.deps.dry_run_pool.stats();
        let cache = self.deps.cache.usage();
        CuStats {
            primary: PoolOccupancy {
                active: primary.active,
                idle: primary.idle,
                pending_tasks: self.deps.primary_queue.waiting() + primary.pending_tasks,
            },
            dry_run: PoolOccupancy {
                active: dry_run.active,
                idle: dry_run.idle,
                pending_tasks: self.deps.dry_run_queue.waiting() + dry_run.pending_tasks,
            },
            process_memory_bytes: process_rss_bytes().unwrap_or(0),
            cache_entries: cache.entries,
            cache_resident_bytes: cache.resident_bytes,
            cache_spilled: cache.spilled,
        }
    }

    /// Prometheus text exposition, with point-in-time gauges refreshed.
    pub fn metrics(&self) -> String {
        let metrics = &self.deps.metrics;
        let usage: CacheUsage = self.deps.cache.usage();
        metrics.cache_entries.set(usage.entries as i64);
        metrics.cache_bytes.set(usage.resident_bytes as i64);
        metrics.cache_spilled.set(usage.spilled as i64);
        metrics
            .pending_read_states
            .set(self.flights.len() as i64);

        for (pool, stats, queue) in [
            ("primary", self.deps.primary_pool.stats(), &self.deps.primary_queue),
            ("dry-run", self.deps.dry_run_pool.stats(), &self.deps.dry_run_queue),
        ] {
            metrics
                .workers
                .with_label_values(&[pool, "active"])
                .set(stats.active as i64);
            metrics
                .workers
                .with_label_values(&[pool, "idle"])
                .set(stats.idle as i64);
            metrics
                .workers
                .with_label_values(&[pool, "pending"])
                .set((queue.waiting() + stats.pending_tasks) as i64);
        }
        metrics.render()
    }

    /// Narrow a shared-run result down to the caller's own target.
    ///
    /// The store fallback covers both directions: a shared run that
    /// overshot a narrower joiner, and a run that came back short of its
    /// own target with nothing but a stale origin (a historical read whose
    /// whole range was already persisted).
    async fn truncate_to(
        &self,
        process_id: &str,
        target: &ReadTarget,
        state: StateResult,
    ) -> Result<StateResult, EvalError> {
        let needs_fallback = match (&state.evaluation, target) {
            (Some(eval), _) => !target.admits_evaluation(eval),
            (None, ReadTarget::Ordinate(o)) => state.origin.ordinate != *o,
            (None, ReadTarget::Timestamp(ts)) => state.origin.timestamp != *ts,
            (None, ReadTarget::Latest) => false,
        };
        if !needs_fallback {
            return Ok(state);
        }

        let query = match target {
            ReadTarget::Ordinate(o) => EvaluationQuery {
                to: Some(o.clone()),
                sort: SortOrder::Descending,
                limit: Some(1),
                ..Default::default()
            },
            ReadTarget::Timestamp(_) => EvaluationQuery {
                sort: SortOrder::Descending,
                ..Default::default()
            },
            ReadTarget::Latest => return Ok(state),
        };
        let evaluation = self
            .deps
            .store
            .find_evaluations(process_id, &query)
            .await?
            .into_iter()
            .find(|eval| target.admits_evaluation(eval));

        Ok(match evaluation {
            Some(eval) => StateResult {
                process_id: process_id.to_string(),
                origin: eval.memory_origin(),
                evaluation: Some(eval),
            },
            None => {
                // Nothing persisted inside the target. An overshot run
                // truncates to the empty view; a run that stopped short
                // already is that view.
                let overshot = match target {
                    ReadTarget::Ordinate(o) => state.origin.ordinate > *o,
                    ReadTarget::Timestamp(ts) => state.origin.timestamp > *ts,
                    ReadTarget::Latest => false,
                };
                if overshot {
                    StateResult {
                        process_id: process_id.to_string(),
                        origin: crate::model::MemoryOrigin::cold_start(process_id),
                        evaluation: None,
                    }
                } else {
                    state
                }
            }
        })
    }
}

/// Recover an owned error from a shared flight result.
fn unshare(err: Arc<EvalError>) -> EvalError {
    match Arc::try_unwrap(err) {
        Ok(owned) => owned,
        Err(shared) => EvalError::Upstream {
            upstream_kind: shared.kind(),
            message: shared.to_string(),
        },
    }
}

/// Resident set size from the platform, when available.
#[cfg(target_os = "linux")]
fn process_rss_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * 4096)
}

#[cfg(not(target_os = "linux"))]
fn process_rss_bytes() -> Option<u64> {
    None
}
