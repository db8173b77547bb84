//! Checkpoint store: memory snapshots across the local and remote tiers.
//!
//! Saving is best-effort and throttled per process; every failure is logged
//! and swallowed so evaluation never blocks on checkpoint durability.
//! Finding walks the tiers in cost order: live cache, local checkpoint
//! index and files, trusted remote checkpoints, then cold start. At equal
//! ordinates the local source wins.

mod bundle;
mod files;
mod gateway;

pub use bundle::{
    BundleError, SignedDataItem, Wallet, build_and_sign_data_item, hash_memory, verify_data_item,
};
pub use files::{CheckpointFileHit, CheckpointFiles};
pub use gateway::{CheckpointNetwork, GatewayError, HttpCheckpointNetwork, tags};

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::instrument;

use crate::cache::ProcessMemoryCache;
use crate::config::CuConfig;
use crate::metrics::CuMetrics;
use crate::model::{
    CheckpointLocation, CheckpointRecord, MemoryOrigin, MemoryPayload, Process, ProcessMemory, Tag,
};
use crate::ordinate::Ordinate;
use crate::store::{SqliteStore, StoreError};

#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum CheckpointError {
    #[error("checkpoint file I/O failed: {0}")]
    #[diagnostic(code(cueval::checkpoint::io))]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Bundle(#[from] BundleError),

    #[error("no wallet configured for checkpoint signing")]
    #[diagnostic(
        code(cueval::checkpoint::no_wallet),
        help("Set WALLET to a signing key file or disable checkpoint creation.")
    )]
    NoWallet,
}

pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Upper bound for a memory lookup: "the latest memory usable when
/// replaying to this point".
///
/// Both fields optional; `None` means unbounded on that axis. The
/// timestamp bound matters for time-targeted reads, where a memory past
/// the requested instant cannot be rewound.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryTarget {
    pub ordinate: Option<Ordinate>,
    pub timestamp: Option<i64>,
}

impl MemoryTarget {
    pub fn latest() -> Self {
        Self::default()
    }

    pub fn at_ordinate(ordinate: Ordinate) -> Self {
        Self {
            ordinate: Some(ordinate),
            timestamp: None,
        }
    }

    pub fn at_timestamp(timestamp: i64) -> Self {
        Self {
            ordinate: None,
            timestamp: Some(timestamp),
        }
    }

    /// Whether a memory at this origin is usable for the target.
    pub fn admits(&self, ordinate: &Ordinate, timestamp: i64) -> bool {
        self.ordinate.as_ref().is_none_or(|o| ordinate <= o)
            && self.timestamp.is_none_or(|t| timestamp <= t)
    }

    fn ordinate_bound(&self) -> Ordinate {
        self.ordinate.clone().unwrap_or_else(Ordinate::upper_bound)
    }
}

/// Trust and cadence knobs for the checkpoint tiers.
#[derive(Debug, Clone)]
pub struct CheckpointPolicy {
    /// Remote uploads disabled; local file references are still recorded.
    pub disabled: bool,
    /// Minimum interval between checkpoints of one process.
    pub throttle: Duration,
    /// Owners whose remote checkpoints are accepted; empty trusts none.
    pub trusted_owners: Vec<String>,
    /// Processes whose remote checkpoints are ignored.
    pub process_ignore_remote: Vec<String>,
    /// Tx ids ignored globally.
    pub ignore_tx_ids: Vec<String>,
}

impl CheckpointPolicy {
    pub fn from_config(cfg: &CuConfig) -> Self {
        Self {
            disabled: cfg.disable_checkpoint_creation,
            throttle: cfg.checkpoint_creation_throttle,
            trusted_owners: cfg.checkpoint_trusted_owners.clone(),
            process_ignore_remote: cfg.process_ignore_remote_checkpoints.clone(),
            ignore_tx_ids: cfg.ignore_remote_checkpoints.clone(),
        }
    }
}

/// Read/write access to memory snapshots across every tier.
pub struct CheckpointStore {
    files: Arc<CheckpointFiles>,
    network: Arc<dyn CheckpointNetwork>,
    wallet: Option<Arc<Wallet>>,
    store: SqliteStore,
    policy: CheckpointPolicy,
    metrics: CuMetrics,
    last_saved: Mutex<FxHashMap<String, Instant>>,
}

impl CheckpointStore {
    pub fn new(
        files: Arc<CheckpointFiles>,
        network: Arc<dyn CheckpointNetwork>,
        wallet: Option<Arc<Wallet>>,
        store: SqliteStore,
        policy: CheckpointPolicy,
        metrics: CuMetrics,
    ) -> Self {
        Self {
            files,
            network,
            wallet,
            store,
            policy,
            metrics,
            last_saved: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn files(&self) -> &Arc<CheckpointFiles> {
        &self.files
    }

    pub fn wallet(&self) -> Option<&Arc<Wallet>> {
        self.wallet.as_ref()
    }

    /// Materialize a memory payload, reading the spill file when needed.
    pub async fn hydrate(&self, payload: &MemoryPayload) -> std::io::Result<Bytes> {
        match payload {
            MemoryPayload::Loaded(bytes) => Ok(bytes.clone()),
            MemoryPayload::Spilled(path) => self.files.read_memory_file(path).await,
        }
    }

    /// Best-effort checkpoint of a process memory.
    ///
    /// Never fails: throttled, disabled, and error outcomes all reduce to a
    /// log line and a counter. The throttle stamp advances only on success,
    /// so the next gas threshold or shutdown sweep retries a failed save.
    #[instrument(skip(self, memory), fields(process_id = %memory.origin.process_id, ordinate = %memory.origin.ordinate))]
    pub async fn save_checkpoint(&self, memory: ProcessMemory) {
        let process_id = memory.origin.process_id.clone();
        if self.is_throttled(&process_id) {
            self.metrics.checkpoints.with_label_values(&["throttled"]).inc();
            tracing::debug!(process_id, "checkpoint suppressed by throttle");
            return;
        }
        match self.try_save(&memory).await {
            Ok(outcome) => {
                self.mark_saved(&process_id);
                self.metrics.checkpoints.with_label_values(&[outcome]).inc();
            }
            Err(e) => {
                self.metrics.checkpoints.with_label_values(&["failed"]).inc();
                tracing::warn!(process_id, error = %e, "checkpoint save failed");
            }
        }
    }

    async fn try_save(&self, memory: &ProcessMemory) -> Result<&'static str> {
        let origin = &memory.origin;
        let bytes = self.hydrate(&memory.memory).await?;

        if self.policy.disabled {
            let name = self
                .files
                .write_checkpoint_file(&origin.process_id, &origin.ordinate, origin.timestamp, &bytes)
                .await?;
            self.write_record(memory, CheckpointLocation::File(name)).await?;
            return Ok("recorded");
        }

        let wallet = self.wallet.as_ref().ok_or(CheckpointError::NoWallet)?;
        let digest = hash_memory(&bytes);
        let mut item_tags = vec![
            Tag::new(tags::TYPE, "Checkpoint"),
            Tag::new(tags::PROCESS, &origin.process_id),
            Tag::new(tags::MODULE, &memory.module_id),
            Tag::new(tags::ORDINATE, origin.ordinate.as_str()),
            Tag::new(tags::TIMESTAMP, origin.timestamp.to_string()),
            Tag::new(tags::BLOCK_HEIGHT, origin.block_height.to_string()),
            Tag::new(tags::MEMORY_DIGEST, digest),
        ];
        if let Some(epoch) = origin.epoch {
            item_tags.push(Tag::new(tags::EPOCH, epoch.to_string()));
        }
        if let Some(nonce) = origin.nonce {
            item_tags.push(Tag::new(tags::NONCE, nonce.to_string()));
        }

        let item = build_and_sign_data_item(&bytes, item_tags, wallet);
        let tx_id = self.network.upload(&item).await?;
        self.write_record(memory, CheckpointLocation::Tx(tx_id)).await?;
        Ok("uploaded")
    }

    async fn write_record(
        &self,
        memory: &ProcessMemory,
        location: CheckpointLocation,
    ) -> Result<()> {
        let origin = &memory.origin;
        self.store
            .write_checkpoint_record(&CheckpointRecord {
                process_id: origin.process_id.clone(),
                module_id: memory.module_id.clone(),
                ordinate: origin.ordinate.clone(),
                timestamp: origin.timestamp,
                block_height: origin.block_height,
                epoch: origin.epoch,
                nonce: origin.nonce,
                location,
            })
            .await?;
        Ok(())
    }

    fn is_throttled(&self, process_id: &str) -> bool {
        let last = self.last_saved.lock();
        last.get(process_id)
            .is_some_and(|at| at.elapsed() < self.policy.throttle)
    }

    fn mark_saved(&self, process_id: &str) {
        self.last_saved
            .lock()
            .insert(process_id.to_string(), Instant::now());
    }

    /// Locate the latest usable memory for a process at or before `target`.
    ///
    /// Tier order: live cache, local checkpoint record, local checkpoint
    /// file scan, trusted remote checkpoint, cold start. Tier failures are
    /// logged and fall through; only store corruption aborts.
    #[instrument(skip(self, cache, process, target), fields(process_id = %process.id), err)]
    pub async fn find_latest_process_memory_before(
        &self,
        cache: &ProcessMemoryCache,
        process: &Process,
        target: &MemoryTarget,
    ) -> Result<ProcessMemory> {
        // Tier 1: live cache.
        if let Some(cached) = cache.get(&process.id) {
            if target.admits(&cached.origin.ordinate, cached.origin.timestamp) {
                match self.hydrate(&cached.memory).await {
                    Ok(bytes) => {
                        return Ok(ProcessMemory {
                            memory: MemoryPayload::Loaded(bytes),
                            ..cached
                        });
                    }
                    Err(e) => {
                        tracing::warn!(process_id = %process.id, error = %e, "cached spill unreadable");
                    }
                }
            }
        }

        let ordinate_bound = target.ordinate_bound();

        // Tier 2: local checkpoint record.
        if let Some(record) = self
            .store
            .find_checkpoint_record_before(&process.id, &ordinate_bound)
            .await?
        {
            if target.admits(&record.ordinate, record.timestamp) {
                match self.load_record(&record).await {
                    Ok(Some(memory)) => return Ok(memory),
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(process_id = %process.id, error = %e, "checkpoint record unusable");
                    }
                }
            }
        }

        // Tier 3: checkpoint file scan, for files the index never saw.
        if let Some(hit) = self
            .files
            .find_checkpoint_file_before(&process.id, &ordinate_bound)
            .filter(|hit| target.admits(&hit.ordinate, hit.timestamp))
        {
            match self.files.read_named(&hit.name).await {
                Ok(bytes) => {
                    return Ok(ProcessMemory {
                        memory: MemoryPayload::Loaded(bytes),
                        module_id: process.module_id.clone(),
                        origin: MemoryOrigin {
                            process_id: process.id.clone(),
                            ordinate: hit.ordinate,
                            timestamp: hit.timestamp,
                            block_height: 0,
                            epoch: None,
                            nonce: None,
                            cron: None,
                        },
                        gas_used: 0,
                    });
                }
                Err(e) => {
                    tracing::warn!(process_id = %process.id, file = %hit.name, error = %e, "checkpoint file unreadable");
                }
            }
        }

        // Tier 4: trusted remote checkpoints.
        if let Some(memory) = self.find_remote_before(process, target).await {
            return Ok(memory);
        }

        // Tier 5: cold start.
        Ok(ProcessMemory::cold_start(
            process.id.clone(),
            process.module_id.clone(),
        ))
    }

    async fn load_record(&self, record: &CheckpointRecord) -> Result<Option<ProcessMemory>> {
        let bytes = match &record.location {
            CheckpointLocation::File(name) => self.files.read_named(name).await?,
            CheckpointLocation::Tx(tx_id) => {
                if self.policy.ignore_tx_ids.iter().any(|id| id == tx_id) {
                    return Ok(None);
                }
                self.network.download(tx_id).await?
            }
        };
        Ok(Some(ProcessMemory {
            memory: MemoryPayload::Loaded(bytes),
            module_id: record.module_id.clone(),
            origin: MemoryOrigin {
                process_id: record.process_id.clone(),
                ordinate: record.ordinate.clone(),
                timestamp: record.timestamp,
                block_height: record.block_height,
                epoch: record.epoch,
                nonce: record.nonce,
                cron: None,
            },
            gas_used: 0,
        }))
    }

    async fn find_remote_before(
        &self,
        process: &Process,
        target: &MemoryTarget,
    ) -> Option<ProcessMemory> {
        if self.policy.trusted_owners.is_empty() {
            return None;
        }
        if self
            .policy
            .process_ignore_remote
            .iter()
            .any(|id| id == &process.id)
        {
            tracing::debug!(process_id = %process.id, "remote checkpoints ignored for process");
            return None;
        }
        let mut candidates = match self
            .network
            .query_checkpoints(&process.id, &self.policy.trusted_owners)
            .await
        {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(process_id = %process.id, error = %e, "checkpoint gateway query failed");
                return None;
            }
        };
        candidates.retain(|c| {
            target.admits(&c.ordinate, c.timestamp)
                && self.policy.trusted_owners.contains(&c.owner)
                && !self.policy.ignore_tx_ids.contains(&c.tx_id)
        });
        candidates.sort_by(|a, b| b.ordinate.cmp(&a.ordinate));

        for candidate in candidates {
            let bytes = match self.network.download(&candidate.tx_id).await {
                Ok(b) => b,
                Err(e) => {
                    tracing::warn!(tx_id = %candidate.tx_id, error = %e, "checkpoint download failed");
                    continue;
                }
            };
            if hash_memory(&bytes) != candidate.memory_hash {
                tracing::warn!(tx_id = %candidate.tx_id, "checkpoint payload digest mismatch, skipping");
                continue;
            }
            return Some(ProcessMemory {
                memory: MemoryPayload::Loaded(bytes),
                module_id: candidate.module_id,
                origin: MemoryOrigin {
                    process_id: candidate.process_id,
                    ordinate: candidate.ordinate,
                    timestamp: candidate.timestamp,
                    block_height: candidate.block_height,
                    epoch: candidate.epoch,
                    nonce: candidate.nonce,
                    cron: None,
                },
                gas_used: 0,
            });
        }
        None
    }
}
