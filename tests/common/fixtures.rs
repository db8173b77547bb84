#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tempfile::TempDir;

use cueval::cache::ProcessMemoryCache;
use cueval::checkpoint::{CheckpointFiles, CheckpointPolicy, CheckpointStore};
use cueval::config::CuConfig;
use cueval::locator::BatchedLocator;
use cueval::metrics::CuMetrics;
use cueval::model::{
    BlockRef, ModuleFormat, ModuleMeta, ModuleOptions, Process, ScheduledMessage, Tag,
};
use cueval::ordinate::Ordinate;
use cueval::pipeline::{AccessPolicy, CuDeps, EvalPipeline};
use cueval::store::SqliteStore;
use cueval::wasm::{ModuleLoader, ModulePolicy, WasmRuntime};
use cueval::workers::{AdmissionQueue, WorkerInit, WorkerPool};

use super::fakes::{FakeLocator, FakeNetwork, FakeSu, StubRuntime};

pub const PROCESS_ID: &str = "proc-1";
pub const MODULE_ID: &str = "mod-1";
pub const OWNER: &str = "owner-1";

/// Knobs the scenarios vary; everything else is a sane default.
pub struct HarnessOptions {
    pub eager_checkpoint_gas_threshold: Option<u64>,
    pub disable_checkpoint_creation: bool,
    pub checkpoint_throttle: Duration,
    pub trusted_owners: Vec<String>,
    pub dry_run_workers: usize,
    pub dry_run_max_queue: Option<usize>,
    pub wallet: bool,
    pub access: AccessPolicy,
    pub runtime: Option<Arc<dyn WasmRuntime>>,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            eager_checkpoint_gas_threshold: None,
            disable_checkpoint_creation: true,
            checkpoint_throttle: Duration::ZERO,
            trusted_owners: vec![],
            dry_run_workers: 1,
            dry_run_max_queue: Some(10),
            wallet: false,
            access: AccessPolicy::default(),
            runtime: None,
        }
    }
}

/// A fully wired dependency graph over in-process fakes and a tempdir.
pub struct Harness {
    pub deps: Arc<CuDeps>,
    pub su: Arc<FakeSu>,
    pub network: Arc<FakeNetwork>,
    pub files: Arc<CheckpointFiles>,
    pub runtime: Arc<StubRuntime>,
    pub dir: TempDir,
}

impl Harness {
    pub fn pipeline(&self) -> EvalPipeline {
        EvalPipeline::new(self.deps.clone())
    }
}

pub async fn harness(options: HarnessOptions) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let metrics = CuMetrics::new().unwrap();
    let store = SqliteStore::connect(dir.path().join("cu.db").to_str().unwrap())
        .await
        .unwrap();
    let files = Arc::new(
        CheckpointFiles::new(dir.path().join("spill"), dir.path().join("checkpoints")).unwrap(),
    );
    let cache = ProcessMemoryCache::new(64 * 1024 * 1024, Duration::from_secs(3600), files.clone());

    let network = Arc::new(FakeNetwork::default());
    let wallet = if options.wallet {
        let rng = ring::rand::SystemRandom::new();
        let pkcs8 = ring::signature::Ed25519KeyPair::generate_pkcs8(&rng).unwrap();
        let path = dir.path().join("wallet.pk8");
        std::fs::write(&path, pkcs8.as_ref()).unwrap();
        Some(Arc::new(cueval::checkpoint::Wallet::load(&path).unwrap()))
    } else {
        None
    };
    let checkpoints = Arc::new(CheckpointStore::new(
        files.clone(),
        network.clone(),
        wallet,
        store.clone(),
        CheckpointPolicy {
            disabled: options.disable_checkpoint_creation,
            throttle: options.checkpoint_throttle,
            trusted_owners: options.trusted_owners.clone(),
            process_ignore_remote: vec![],
            ignore_tx_ids: vec![],
        },
        metrics.clone(),
    ));

    let binary_dir = dir.path().join("binaries");
    // Unroutable endpoints: every network touch in a test must be a bug.
    let modules = Arc::new(
        ModuleLoader::new(
            "http://127.0.0.1:1",
            "http://127.0.0.1:1/graphql",
            &binary_dir,
            4,
        )
        .unwrap(),
    );
    std::fs::write(binary_dir.join(MODULE_ID), b"\0asm-stub").unwrap();

    let su = Arc::new(FakeSu::default());
    let locator = BatchedLocator::with_window(
        Arc::new(FakeLocator::default()),
        Duration::from_millis(1),
    );

    // The stub handle stays observable even when a custom runtime runs.
    let stub = Arc::new(StubRuntime::default());
    let runtime: Arc<dyn WasmRuntime> = match &options.runtime {
        Some(runtime) => runtime.clone(),
        None => stub.clone(),
    };

    let init = WorkerInit {
        module_cache_max_size: 4,
        instance_cache_max_size: 4,
        binary_dir,
        network_url: "http://127.0.0.1:1".into(),
        store_path: "cu.db".into(),
        worker_id: String::new(),
    };
    let primary_pool = Arc::new(WorkerPool::new("primary", 2, runtime.clone(), init.clone()));
    let dry_run_pool = Arc::new(WorkerPool::new(
        "dry-run",
        options.dry_run_workers,
        runtime,
        init,
    ));

    let cfg = CuConfig::default();
    let deps = Arc::new(CuDeps {
        store,
        cache,
        checkpoints,
        modules,
        su: su.clone(),
        locator,
        primary_pool,
        primary_queue: AdmissionQueue::new(2, None),
        dry_run_pool,
        dry_run_queue: AdmissionQueue::new(options.dry_run_workers, options.dry_run_max_queue),
        module_policy: ModulePolicy::from_config(&cfg),
        access: options.access,
        metrics,
        eager_checkpoint_gas_threshold: options.eager_checkpoint_gas_threshold,
    });

    Harness {
        deps,
        su,
        network,
        files,
        runtime: stub,
        dir,
    }
}

/// Seed the store with the canonical test process and module.
pub async fn seed_process(harness: &Harness) {
    harness
        .deps
        .store
        .save_process(&test_process())
        .await
        .unwrap();
    harness
        .deps
        .store
        .save_module(&test_module())
        .await
        .unwrap();
}

pub fn test_process() -> Process {
    Process {
        id: PROCESS_ID.into(),
        owner: OWNER.into(),
        tags: vec![Tag::new("Type", "Process")],
        signature: "sig".into(),
        block: BlockRef {
            height: 100,
            timestamp: 1_700_000_000_000,
        },
        module_id: MODULE_ID.into(),
    }
}

pub fn test_module() -> ModuleMeta {
    ModuleMeta {
        id: MODULE_ID.into(),
        owner: "module-owner".into(),
        tags: vec![],
        format: ModuleFormat("wasm32-unknown-emscripten".into()),
        options: ModuleOptions {
            memory_limit: 1 << 20,
            compute_limit: 1_000_000,
            extensions: vec![],
        },
    }
}

/// A plain user message at an integer ordinate.
pub fn message(ordinate: u64) -> ScheduledMessage {
    ScheduledMessage {
        ordinate: Ordinate::from_int(ordinate),
        message_id: Some(format!("msg-{ordinate}")),
        is_assignment: false,
        cron: None,
        tags: vec![],
        data: Some(serde_json::json!({ "n": ordinate })),
        block_height: 100 + ordinate,
        timestamp: 1_700_000_000_000 + ordinate as i64 * 1000,
        epoch: Some(0),
        nonce: Some(ordinate),
        deep_hash: Some(format!("deep-{ordinate}")),
    }
}

pub fn cron_message(ordinate: u64, interval: &str) -> ScheduledMessage {
    ScheduledMessage {
        message_id: None,
        cron: Some(interval.into()),
        deep_hash: None,
        ..message(ordinate)
    }
}

/// The memory bytes the stub runtime produces after replaying `1..=n`.
pub fn expected_memory(upto: u64) -> Bytes {
    let mut out = Vec::new();
    for n in 1..=upto {
        out.extend_from_slice(n.to_string().as_bytes());
    }
    Bytes::from(out)
}
