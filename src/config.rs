//! Runtime configuration for the evaluation core.
//!
//! `CuConfig` collects every recognized option with sensible defaults.
//! [`CuConfig::from_env`] layers the process environment (after loading a
//! `.env` file when present) on top of those defaults; hosts embedding the
//! core can also build the struct directly.

use std::path::PathBuf;
use std::time::Duration;

/// All tunables recognized by the evaluation core.
#[derive(Debug, Clone)]
pub struct CuConfig {
    /// Total worker cap across both pools (`WASM_EVALUATION_MAX_WORKERS`).
    pub max_workers: usize,
    /// Percentage of workers reserved for the primary pool
    /// (`WASM_EVALUATION_PRIMARY_WORKERS_PERCENTAGE`).
    pub primary_workers_percentage: u32,
    /// Dry-run admission ceiling (`WASM_EVALUATION_WORKERS_DRY_RUN_MAX_QUEUE`).
    pub dry_run_max_queue: usize,

    /// Per-worker compiled-module cache entries (`WASM_MODULE_CACHE_MAX_SIZE`).
    pub module_cache_max_size: usize,
    /// Per-worker instance cache entries (`WASM_INSTANCE_CACHE_MAX_SIZE`).
    pub instance_cache_max_size: usize,
    /// Local cache of module binaries (`WASM_BINARY_FILE_DIRECTORY`).
    pub wasm_binary_dir: PathBuf,

    /// In-memory tier bound in bytes (`PROCESS_MEMORY_CACHE_MAX_SIZE`).
    pub memory_cache_max_bytes: usize,
    /// In-memory tier TTL (`PROCESS_MEMORY_CACHE_TTL`, milliseconds).
    pub memory_cache_ttl: Duration,
    /// Spill directory (`PROCESS_MEMORY_CACHE_FILE_DIR`).
    pub memory_spill_dir: PathBuf,

    /// Local checkpoint file dir (`PROCESS_CHECKPOINT_FILE_DIRECTORY`).
    pub checkpoint_file_dir: PathBuf,
    /// Disable remote checkpoint uploads (`DISABLE_PROCESS_CHECKPOINT_CREATION`).
    pub disable_checkpoint_creation: bool,
    /// Per-process minimum interval between checkpoints
    /// (`PROCESS_CHECKPOINT_CREATION_THROTTLE`, milliseconds).
    pub checkpoint_creation_throttle: Duration,
    /// Accumulated gas that triggers an opportunistic checkpoint
    /// (`EAGER_CHECKPOINT_ACCUMULATED_GAS_THRESHOLD`); `None` disables.
    pub eager_checkpoint_gas_threshold: Option<u64>,

    /// Processes for which remote checkpoints are ignored
    /// (`PROCESS_IGNORE_ARWEAVE_CHECKPOINTS`).
    pub process_ignore_remote_checkpoints: Vec<String>,
    /// Checkpoint tx ids ignored globally (`IGNORE_ARWEAVE_CHECKPOINTS`).
    pub ignore_remote_checkpoints: Vec<String>,
    /// Only accept remote checkpoints from these owners
    /// (`PROCESS_CHECKPOINT_TRUSTED_OWNERS`); empty trusts no one.
    pub checkpoint_trusted_owners: Vec<String>,

    /// Access control (`ALLOW_OWNERS`); empty allows every owner.
    pub allow_owners: Vec<String>,
    /// Process denylist (`RESTRICT_PROCESSES`).
    pub restrict_processes: Vec<String>,
    /// Process allowlist (`ALLOW_PROCESSES`); empty allows every process.
    pub allow_processes: Vec<String>,

    /// Module admissibility (`PROCESS_WASM_MEMORY_MAX_LIMIT`).
    pub wasm_memory_max_limit: u64,
    /// Module admissibility (`PROCESS_WASM_COMPUTE_MAX_LIMIT`).
    pub wasm_compute_max_limit: u64,
    /// Accepted module formats (`PROCESS_WASM_SUPPORTED_FORMATS`).
    pub wasm_supported_formats: Vec<String>,
    /// Accepted module extensions (`PROCESS_WASM_SUPPORTED_EXTENSIONS`).
    pub wasm_supported_extensions: Vec<String>,

    /// Gateway GraphQL endpoint (`GRAPHQL_URL`).
    pub graphql_url: String,
    /// Dedicated checkpoint gateway (`CHECKPOINT_GRAPHQL_URL`); falls back
    /// to `graphql_url` when unset.
    pub checkpoint_graphql_url: Option<String>,
    /// Content-addressed network base URL (`ARWEAVE_URL`).
    pub arweave_url: String,
    /// Bundler endpoint for checkpoint uploads (`UPLOADER_URL`).
    pub uploader_url: String,
    /// SQLite database URL (`DB_URL`).
    pub db_url: String,
    /// Path to the CU wallet key file (`WALLET`).
    pub wallet_path: Option<PathBuf>,
}

impl Default for CuConfig {
    fn default() -> Self {
        let max_workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            max_workers,
            primary_workers_percentage: 80,
            dry_run_max_queue: 100,
            module_cache_max_size: 5,
            instance_cache_max_size: 5,
            wasm_binary_dir: PathBuf::from("wasm-binaries"),
            memory_cache_max_bytes: 500 * 1024 * 1024,
            memory_cache_ttl: Duration::from_secs(60 * 60 * 24),
            memory_spill_dir: PathBuf::from("memory-spill"),
            checkpoint_file_dir: PathBuf::from("checkpoints"),
            disable_checkpoint_creation: true,
            checkpoint_creation_throttle: Duration::from_secs(30 * 60),
            eager_checkpoint_gas_threshold: None,
            process_ignore_remote_checkpoints: vec![],
            ignore_remote_checkpoints: vec![],
            checkpoint_trusted_owners: vec![],
            allow_owners: vec![],
            restrict_processes: vec![],
            allow_processes: vec![],
            wasm_memory_max_limit: 1 << 32,
            wasm_compute_max_limit: 9_000_000_000_000,
            wasm_supported_formats: vec![
                "wasm32-unknown-emscripten".into(),
                "wasm64-unknown-emscripten-draft_2024_02_15".into(),
            ],
            wasm_supported_extensions: vec![],
            graphql_url: "https://arweave.net/graphql".into(),
            checkpoint_graphql_url: None,
            arweave_url: "https://arweave.net".into(),
            uploader_url: "https://up.arweave.net".into(),
            db_url: "cueval.db".into(),
            wallet_path: None,
        }
    }
}

impl CuConfig {
    /// Build a config from the environment, loading `.env` first.
    ///
    /// Unset variables keep their defaults; malformed numeric values are
    /// ignored rather than fatal.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let mut cfg = Self::default();

        if let Some(n) = env_parse("WASM_EVALUATION_MAX_WORKERS") {
            cfg.max_workers = n;
        }
        if let Some(n) = env_parse("WASM_EVALUATION_PRIMARY_WORKERS_PERCENTAGE") {
            cfg.primary_workers_percentage = n;
        }
        if let Some(n) = env_parse("WASM_EVALUATION_WORKERS_DRY_RUN_MAX_QUEUE") {
            cfg.dry_run_max_queue = n;
        }
        if let Some(n) = env_parse("WASM_MODULE_CACHE_MAX_SIZE") {
            cfg.module_cache_max_size = n;
        }
        if let Some(n) = env_parse("WASM_INSTANCE_CACHE_MAX_SIZE") {
            cfg.instance_cache_max_size = n;
        }
        if let Some(p) = env_string("WASM_BINARY_FILE_DIRECTORY") {
            cfg.wasm_binary_dir = PathBuf::from(p);
        }
        if let Some(n) = env_parse("PROCESS_MEMORY_CACHE_MAX_SIZE") {
            cfg.memory_cache_max_bytes = n;
        }
        if let Some(ms) = env_parse("PROCESS_MEMORY_CACHE_TTL") {
            cfg.memory_cache_ttl = Duration::from_millis(ms);
        }
        if let Some(p) = env_string("PROCESS_MEMORY_CACHE_FILE_DIR") {
            cfg.memory_spill_dir = PathBuf::from(p);
        }
        if let Some(p) = env_string("PROCESS_CHECKPOINT_FILE_DIRECTORY") {
            cfg.checkpoint_file_dir = PathBuf::from(p);
        }
        if let Some(v) = env_string("DISABLE_PROCESS_CHECKPOINT_CREATION") {
            cfg.disable_checkpoint_creation = v != "false";
        }
        if let Some(ms) = env_parse("PROCESS_CHECKPOINT_CREATION_THROTTLE") {
            cfg.checkpoint_creation_throttle = Duration::from_millis(ms);
        }
        if let Some(n) = env_parse("EAGER_CHECKPOINT_ACCUMULATED_GAS_THRESHOLD") {
            cfg.eager_checkpoint_gas_threshold = if n == 0 { None } else { Some(n) };
        }
        if let Some(v) = env_list("PROCESS_IGNORE_ARWEAVE_CHECKPOINTS") {
            cfg.process_ignore_remote_checkpoints = v;
        }
        if let Some(v) = env_list("IGNORE_ARWEAVE_CHECKPOINTS") {
            cfg.ignore_remote_checkpoints = v;
        }
        if let Some(v) = env_list("PROCESS_CHECKPOINT_TRUSTED_OWNERS") {
            cfg.checkpoint_trusted_owners = v;
        }
        if let Some(v) = env_list("ALLOW_OWNERS") {
            cfg.allow_owners = v;
        }
        if let Some(v) = env_list("RESTRICT_PROCESSES") {
            cfg.restrict_processes = v;
        }
        if let Some(v) = env_list("ALLOW_PROCESSES") {
            cfg.allow_processes = v;
        }
        if let Some(n) = env_parse("PROCESS_WASM_MEMORY_MAX_LIMIT") {
            cfg.wasm_memory_max_limit = n;
        }
        if let Some(n) = env_parse("PROCESS_WASM_COMPUTE_MAX_LIMIT") {
            cfg.wasm_compute_max_limit = n;
        }
        if let Some(v) = env_list("PROCESS_WASM_SUPPORTED_FORMATS") {
            cfg.wasm_supported_formats = v;
        }
        if let Some(v) = env_list("PROCESS_WASM_SUPPORTED_EXTENSIONS") {
            cfg.wasm_supported_extensions = v;
        }
        if let Some(v) = env_string("GRAPHQL_URL") {
            cfg.graphql_url = v;
        }
        if let Some(v) = env_string("CHECKPOINT_GRAPHQL_URL") {
            cfg.checkpoint_graphql_url = Some(v);
        }
        if let Some(v) = env_string("ARWEAVE_URL") {
            cfg.arweave_url = v;
        }
        if let Some(v) = env_string("UPLOADER_URL") {
            cfg.uploader_url = v;
        }
        if let Some(v) = env_string("DB_URL") {
            cfg.db_url = v;
        }
        if let Some(v) = env_string("WALLET") {
            cfg.wallet_path = Some(PathBuf::from(v));
        }

        cfg
    }

    /// The checkpoint gateway, falling back to the general gateway.
    pub fn checkpoint_gateway_url(&self) -> &str {
        self.checkpoint_graphql_url
            .as_deref()
            .unwrap_or(&self.graphql_url)
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.parse().ok())
}

/// Comma-separated list; empty entries are dropped.
fn env_list(key: &str) -> Option<Vec<String>> {
    env_string(key).map(|v| {
        v.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}
