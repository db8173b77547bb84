//! The per-process evaluation pipeline.
//!
//! For a target `(process, to)` the pipeline resolves the process and its
//! module, locates the best starting memory, then folds the scheduler's
//! message stream into it one evaluation at a time: duplicate identities
//! skip, every applied message persists an evaluation row, gas accumulates
//! toward an opportunistic checkpoint, and the terminal memory lands back
//! in the cache. Evaluation errors reported by the process are data, not
//! failures; the pipeline only aborts on invalid input or broken
//! infrastructure.
//!
//! Ordering within a process comes from the serial submission pattern:
//! each worker result is awaited before the next message is admitted.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use tracing::instrument;

use crate::cache::ProcessMemoryCache;
use crate::checkpoint::{CheckpointError, CheckpointStore, MemoryTarget};
use crate::locator::{BatchedLocator, LocatorError};
use crate::metrics::CuMetrics;
use crate::model::{
    EvalOutput, Evaluation, MemoryOrigin, MemoryPayload, ModuleMeta, Process, ProcessMemory,
    ScheduledMessage,
};
use crate::ordinate::{Ordinate, SortOrder};
use crate::store::{EvaluationQuery, MessageBeforeQuery, SqliteStore, StoreError};
use crate::su::{MessageBound, SchedulerUnit, SuError};
use crate::wasm::{EvalRequest, ModuleLoader, ModulePolicy, WasmError};
use crate::workers::{AdmissionError, AdmissionQueue, WorkerPool};

/// Broad classes the error surface maps onto, for transport layers that
/// need a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Invalid,
    Transient,
    Overloaded,
    Fatal,
}

#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum EvalError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Su(#[from] SuError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Locator(#[from] LocatorError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Wasm(#[from] WasmError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Pool(#[from] crate::workers::PoolError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Admission(#[from] AdmissionError),

    #[error("memory file I/O failed: {0}")]
    #[diagnostic(code(cueval::pipeline::io))]
    Io(#[from] std::io::Error),

    #[error("access denied for process {process_id}: {reason}")]
    #[diagnostic(
        code(cueval::pipeline::access),
        help("The process or its owner is outside this CU's allowlists.")
    )]
    AccessDenied { process_id: String, reason: String },

    #[error("{what} not found")]
    #[diagnostic(code(cueval::pipeline::not_found))]
    NotFound { what: String },

    #[error("evaluation task dropped before completion")]
    #[diagnostic(code(cueval::pipeline::dropped))]
    Dropped,

    /// A failure observed through a shared in-flight run; the original
    /// error went to another waiter.
    #[error("{message}")]
    #[diagnostic(code(cueval::pipeline::upstream))]
    Upstream { upstream_kind: ErrorKind, message: String },
}

impl EvalError {
    /// Classify for the transport layer; `Overloaded` is the 429 case.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EvalError::Upstream { upstream_kind, .. } => *upstream_kind,
            EvalError::NotFound { .. } | EvalError::Su(SuError::NotFound { .. }) => {
                ErrorKind::NotFound
            }
            EvalError::AccessDenied { .. }
            | EvalError::Wasm(WasmError::Inadmissible { .. })
            | EvalError::Wasm(WasmError::Compile { .. })
            | EvalError::Locator(LocatorError::Unregistered { .. }) => ErrorKind::Invalid,
            EvalError::Admission(AdmissionError::Overloaded) => ErrorKind::Overloaded,
            EvalError::Su(_)
            | EvalError::Locator(_)
            | EvalError::Wasm(WasmError::Fetch(_))
            | EvalError::Checkpoint(_) => ErrorKind::Transient,
            _ => ErrorKind::Fatal,
        }
    }
}

pub type Result<T> = std::result::Result<T, EvalError>;

/// How far a read should advance.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadTarget {
    /// Everything the scheduler currently has.
    Latest,
    /// Up to and including this ordinate.
    Ordinate(Ordinate),
    /// Up to and including this timestamp.
    Timestamp(i64),
}

impl ReadTarget {
    pub fn memory_target(&self) -> MemoryTarget {
        match self {
            ReadTarget::Latest => MemoryTarget::latest(),
            ReadTarget::Ordinate(o) => MemoryTarget::at_ordinate(o.clone()),
            ReadTarget::Timestamp(t) => MemoryTarget::at_timestamp(*t),
        }
    }

    fn message_bound(&self) -> MessageBound {
        match self {
            ReadTarget::Latest => MessageBound::Unbounded,
            ReadTarget::Ordinate(o) => MessageBound::Ordinate(o.clone()),
            ReadTarget::Timestamp(t) => MessageBound::Timestamp(*t),
        }
    }

    /// Whether a run to `self` also answers a request for `other`.
    pub fn covers(&self, other: &ReadTarget) -> bool {
        match (self, other) {
            (ReadTarget::Latest, _) => true,
            (ReadTarget::Ordinate(a), ReadTarget::Ordinate(b)) => b <= a,
            (ReadTarget::Timestamp(a), ReadTarget::Timestamp(b)) => b <= a,
            _ => false,
        }
    }

    /// Whether an already-persisted evaluation falls inside this target.
    pub fn admits_evaluation(&self, eval: &Evaluation) -> bool {
        match self {
            ReadTarget::Latest => true,
            ReadTarget::Ordinate(o) => eval.ordinate <= *o,
            ReadTarget::Timestamp(t) => eval.timestamp <= *t,
        }
    }
}

impl std::fmt::Display for ReadTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadTarget::Latest => f.write_str("latest"),
            ReadTarget::Ordinate(o) => write!(f, "ordinate:{o}"),
            ReadTarget::Timestamp(t) => write!(f, "timestamp:{t}"),
        }
    }
}

/// Id-level access control; owner checks happen once the process resolves.
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    pub allow_owners: Vec<String>,
    pub restrict_processes: Vec<String>,
    pub allow_processes: Vec<String>,
}

impl AccessPolicy {
    pub fn from_config(cfg: &crate::config::CuConfig) -> Self {
        Self {
            allow_owners: cfg.allow_owners.clone(),
            restrict_processes: cfg.restrict_processes.clone(),
            allow_processes: cfg.allow_processes.clone(),
        }
    }

    pub fn check_process_id(&self, process_id: &str) -> Result<()> {
        if self.restrict_processes.iter().any(|p| p == process_id) {
            return Err(EvalError::AccessDenied {
                process_id: process_id.to_string(),
                reason: "process is restricted".into(),
            });
        }
        if !self.allow_processes.is_empty()
            && !self.allow_processes.iter().any(|p| p == process_id)
        {
            return Err(EvalError::AccessDenied {
                process_id: process_id.to_string(),
                reason: "process not in allowlist".into(),
            });
        }
        Ok(())
    }

    pub fn check_owner(&self, process: &Process) -> Result<()> {
        if !self.allow_owners.is_empty() && !self.allow_owners.iter().any(|o| o == &process.owner)
        {
            return Err(EvalError::AccessDenied {
                process_id: process.id.clone(),
                reason: "owner not in allowlist".into(),
            });
        }
        Ok(())
    }
}

/// Everything the pipeline and read APIs depend on, wired explicitly.
pub struct CuDeps {
    pub store: SqliteStore,
    pub cache: ProcessMemoryCache,
    pub checkpoints: Arc<CheckpointStore>,
    pub modules: Arc<ModuleLoader>,
    pub su: Arc<dyn SchedulerUnit>,
    pub locator: BatchedLocator,
    pub primary_pool: Arc<WorkerPool>,
    pub primary_queue: AdmissionQueue,
    pub dry_run_pool: Arc<WorkerPool>,
    pub dry_run_queue: AdmissionQueue,
    pub module_policy: ModulePolicy,
    pub access: AccessPolicy,
    pub metrics: CuMetrics,
    pub eager_checkpoint_gas_threshold: Option<u64>,
}

/// Where a process stands after a pipeline run.
#[derive(Debug, Clone)]
pub struct StateResult {
    pub process_id: String,
    /// The evaluation the terminal memory corresponds to.
    pub origin: MemoryOrigin,
    /// Terminal evaluation row, when one exists at the target.
    pub evaluation: Option<Evaluation>,
}

/// The evaluation state machine. Cheap to clone; clones share dependencies.
#[derive(Clone)]
pub struct EvalPipeline {
    deps: Arc<CuDeps>,
}

impl EvalPipeline {
    pub fn new(deps: Arc<CuDeps>) -> Self {
        Self { deps }
    }

    pub fn deps(&self) -> &Arc<CuDeps> {
        &self.deps
    }

    /// Resolve a process from the store, hydrating from its scheduler on
    /// first sight.
    #[instrument(skip(self), err)]
    pub async fn resolve_process(&self, process_id: &str) -> Result<Process> {
        self.deps.access.check_process_id(process_id)?;
        let process = match self.deps.store.find_process(process_id).await? {
            Some(found) => found,
            None => {
                let location = self.deps.locator.locate(process_id).await?;
                let fetched = self
                    .deps
                    .su
                    .load_process(&location.su_url, process_id)
                    .await?;
                self.deps.store.save_process(&fetched).await?;
                fetched
            }
        };
        self.deps.access.check_owner(&process)?;
        Ok(process)
    }

    /// Resolve module metadata, hydrating from the network on first sight.
    /// Admissibility is enforced on every path.
    #[instrument(skip(self), err)]
    pub async fn resolve_module(&self, module_id: &str) -> Result<ModuleMeta> {
        let module = match self.deps.store.find_module(module_id).await? {
            Some(found) => found,
            None => {
                let fetched = self.deps.modules.load_module_meta(module_id).await?;
                self.deps.store.save_module(&fetched).await?;
                fetched
            }
        };
        self.deps.module_policy.check(&module)?;
        Ok(module)
    }

    /// Replay a process up to `target`, persisting every new evaluation.
    #[instrument(skip(self, target), fields(target = %target), err)]
    pub async fn read_state(&self, process_id: &str, target: ReadTarget) -> Result<StateResult> {
        let deps = &self.deps;
        let process = self.resolve_process(process_id).await?;
        let module = self.resolve_module(&process.module_id).await?;
        let location = deps.locator.locate(process_id).await?;

        let start = deps
            .checkpoints
            .find_latest_process_memory_before(&deps.cache, &process, &target.memory_target())
            .await?;

        // Already at (or past) an ordinate target: nothing to stream.
        if let ReadTarget::Ordinate(o) = &target {
            if start.origin.ordinate >= *o {
                let evaluation = deps
                    .store
                    .find_evaluation(process_id, &start.origin.ordinate, start.origin.cron.as_deref())
                    .await?;
                self.save_latest_process_memory(&start);
                return Ok(StateResult {
                    process_id: process_id.to_string(),
                    origin: start.origin,
                    evaluation,
                });
            }
        }

        let binary = deps.modules.load_module(&module.id).await?;
        let mut memory = match &start.memory {
            MemoryPayload::Loaded(bytes) => bytes.clone(),
            MemoryPayload::Spilled(_) => deps.checkpoints.hydrate(&start.memory).await?,
        };
        let mut origin = start.origin.clone();
        let mut gas_accumulated = start.gas_used;
        let mut terminal: Option<Evaluation> = None;

        let mut stream = deps.su.load_messages(
            &location.su_url,
            process_id,
            origin.ordinate.clone(),
            target.message_bound(),
        );

        while let Some(message) = stream.next().await {
            let message = message?;

            // Idempotent replay: an identity already in the store skips.
            if !message.is_cron() {
                let probe = MessageBeforeQuery::for_evaluation(process_id, &message);
                if deps.store.find_message_before(&probe).await?.is_some() {
                    deps.metrics
                        .duplicate_messages
                        .with_label_values(&[message_type(&message)])
                        .inc();
                    tracing::debug!(
                        process_id,
                        ordinate = %message.ordinate,
                        "duplicate message identity, skipping"
                    );
                    continue;
                }
            }

            // Admission first; the memory clone happens only once a worker
            // slot is actually available.
            let request_memory = &memory;
            let outcome = deps
                .primary_queue
                .submit(|| {
                    let request = EvalRequest {
                        process_id: process_id.to_string(),
                        module_id: module.id.clone(),
                        binary: binary.clone(),
                        options: module.options.clone(),
                        memory: request_memory.clone(),
                        message: message.clone(),
                    };
                    deps.primary_pool.evaluate(request)
                })
                .await??;

            let evaluation = evaluation_from(process_id, &message, &outcome.output, outcome.gas_used);
            deps.store.save_evaluation(&evaluation).await?;
            deps.metrics
                .evaluations
                .with_label_values(&[
                    "scheduled",
                    message_type(&message),
                    bool_label(evaluation.output.error.is_some()),
                ])
                .inc();

            memory = outcome.memory;
            origin = origin_from(process_id, &message);
            gas_accumulated = gas_accumulated.saturating_add(outcome.gas_used);
            terminal = Some(evaluation);

            if let Some(threshold) = deps.eager_checkpoint_gas_threshold {
                if gas_accumulated >= threshold {
                    self.trigger_eager_checkpoint(&module, &memory, &origin, gas_accumulated);
                    gas_accumulated = 0;
                }
            }
        }

        let latest = ProcessMemory {
            memory: MemoryPayload::Loaded(memory),
            module_id: module.id.clone(),
            origin: origin.clone(),
            gas_used: gas_accumulated,
        };
        self.save_latest_process_memory(&latest);

        if terminal.is_none() {
            terminal = deps
                .store
                .find_evaluation(process_id, &origin.ordinate, origin.cron.as_deref())
                .await?;
        }
        // A historical read can start cold while every message in range is
        // already persisted: dedup skips them all and the loop never
        // advances. Recover the terminal row for the requested target from
        // the store instead of reporting the stale starting origin.
        if terminal.is_none() {
            let recovery = EvaluationQuery {
                to: match &target {
                    ReadTarget::Ordinate(o) => Some(o.clone()),
                    _ => None,
                },
                sort: SortOrder::Descending,
                limit: match &target {
                    ReadTarget::Timestamp(_) => None,
                    _ => Some(1),
                },
                ..Default::default()
            };
            terminal = deps
                .store
                .find_evaluations(process_id, &recovery)
                .await?
                .into_iter()
                .find(|eval| target.admits_evaluation(eval));
            if let Some(eval) = &terminal {
                if eval.ordinate > origin.ordinate {
                    origin = eval.memory_origin();
                }
            }
        }
        Ok(StateResult {
            process_id: process_id.to_string(),
            origin,
            evaluation: terminal,
        })
    }

    /// Speculatively evaluate `overlay` against the memory at `target`.
    ///
    /// Nothing persists and the cache is untouched; the caller is expected
    /// to have advanced state to `target` first. Saturation of the dry-run
    /// pool surfaces as an overload error.
    #[instrument(skip(self, overlay, target), err)]
    pub async fn dry_run(
        &self,
        process_id: &str,
        target: &MemoryTarget,
        overlay: ScheduledMessage,
    ) -> Result<EvalOutput> {
        let deps = &self.deps;
        let process = self.resolve_process(process_id).await?;
        let module = self.resolve_module(&process.module_id).await?;
        let binary = deps.modules.load_module(&module.id).await?;

        let start = deps
            .checkpoints
            .find_latest_process_memory_before(&deps.cache, &process, target)
            .await?;
        let memory = deps.checkpoints.hydrate(&start.memory).await?;

        let outcome = deps
            .dry_run_queue
            .submit(|| {
                let request = EvalRequest {
                    process_id: process_id.to_string(),
                    module_id: module.id.clone(),
                    binary: binary.clone(),
                    options: module.options.clone(),
                    memory: memory.clone(),
                    message: overlay.clone(),
                };
                deps.dry_run_pool.evaluate(request)
            })
            .await??;

        deps.metrics
            .evaluations
            .with_label_values(&[
                "dry-run",
                message_type(&overlay),
                bool_label(outcome.output.error.is_some()),
            ])
            .inc();
        Ok(outcome.output)
    }

    /// Update the cache with a newer memory; never regress the ordinate.
    fn save_latest_process_memory(&self, latest: &ProcessMemory) {
        let process_id = &latest.origin.process_id;
        if let Some(existing) = self.deps.cache.get(process_id) {
            if existing.origin.ordinate > latest.origin.ordinate {
                return;
            }
        }
        self.deps.cache.set(process_id.clone(), latest.clone());
    }

    /// Fire-and-forget checkpoint once accumulated gas crosses the
    /// threshold; the save pipeline owns throttling and error swallowing.
    fn trigger_eager_checkpoint(
        &self,
        module: &ModuleMeta,
        memory: &Bytes,
        origin: &MemoryOrigin,
        gas_accumulated: u64,
    ) {
        let checkpoints = self.deps.checkpoints.clone();
        let snapshot = ProcessMemory {
            memory: MemoryPayload::Loaded(memory.clone()),
            module_id: module.id.clone(),
            origin: origin.clone(),
            gas_used: gas_accumulated,
        };
        tracing::debug!(
            process_id = %origin.process_id,
            ordinate = %origin.ordinate,
            gas_accumulated,
            "eager checkpoint triggered"
        );
        tokio::spawn(async move {
            checkpoints.save_checkpoint(snapshot).await;
        });
    }
}

fn message_type(message: &ScheduledMessage) -> &'static str {
    if message.is_cron() {
        "cron"
    } else if message.is_assignment {
        "assignment"
    } else {
        "message"
    }
}

fn bool_label(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}

fn origin_from(process_id: &str, message: &ScheduledMessage) -> MemoryOrigin {
    MemoryOrigin {
        process_id: process_id.to_string(),
        ordinate: message.ordinate.clone(),
        timestamp: message.timestamp,
        block_height: message.block_height,
        epoch: message.epoch,
        nonce: message.nonce,
        cron: message.cron.clone(),
    }
}

fn evaluation_from(
    process_id: &str,
    message: &ScheduledMessage,
    output: &EvalOutput,
    gas_used: u64,
) -> Evaluation {
    Evaluation {
        process_id: process_id.to_string(),
        ordinate: message.ordinate.clone(),
        cron: message.cron.clone(),
        timestamp: message.timestamp,
        block_height: message.block_height,
        message_id: message.message_id.clone(),
        deep_hash: message.deep_hash.clone(),
        epoch: message.epoch,
        nonce: message.nonce,
        output: output.clone(),
        gas_used,
    }
}
