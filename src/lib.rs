//! # cueval: Compute Unit evaluation core
//!
//! `cueval` answers queries of the form "what is the state / result of
//! process P after message M (or time T)?" for a network of deterministic
//! WASM processes. Process state is an evolving byte buffer; an ordered
//! message log (served by an external Scheduler Unit) drives state
//! transitions. The core replays messages from the nearest known checkpoint
//! up to the requested point and caches aggressively so successive queries
//! do not redo work.
//!
//! ## Core Concepts
//!
//! - **Process**: a deterministic WASM program identified by an opaque id,
//!   whose state is a byte buffer.
//! - **Ordinate**: totally ordered position of a message in a process log.
//! - **Evaluation**: the persisted outcome of applying one message, keyed by
//!   `(process, ordinate)` and never mutated.
//! - **Checkpoint**: a signed, content-addressed snapshot of process memory
//!   at a given ordinate.
//! - **Dry-run**: speculative evaluation of an overlay message without
//!   persistence.
//!
//! ## Architecture
//!
//! ```text
//! api (read_state / read_result / dry_run / checkpoint_all)
//!  └─ pipeline (locate memory → stream messages → evaluate → persist)
//!      ├─ cache      bounded LRU of live memories, file spill, TTL
//!      ├─ checkpoint local files + content-addressed network snapshots
//!      ├─ store      SQLite records: processes, modules, evaluations
//!      ├─ su         ordered message pages from the Scheduler Unit
//!      ├─ wasm       module bytes + the runtime seam workers execute
//!      └─ workers    admission-gated pools of evaluation threads
//! ```
//!
//! Reads for the same process share one pipeline run (single flight); the
//! memory cache has a single owner and buffers move to workers by value, so
//! replay is deterministic regardless of which caller triggered it.
//!
//! ## Module Guide
//!
//! - [`api`] - Read APIs, single-flight coordination, bulk checkpointing
//! - [`pipeline`] - The per-process evaluation state machine
//! - [`store`] - Embedded relational persistence (SQLite)
//! - [`cache`] - Tiered process-memory cache
//! - [`checkpoint`] - Checkpoint files, gateway discovery, signed uploads
//! - [`wasm`] - Module loading and the `WasmRuntime` execution seam
//! - [`su`] - Scheduler Unit client and message streams
//! - [`workers`] - Worker pools and admission queues
//! - [`locator`] - Batched scheduler location lookups
//! - [`ordinate`] - The log-position total order
//! - [`model`] - Shared data model

pub mod api;
pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod locator;
pub mod metrics;
pub mod model;
pub mod ordinate;
pub mod pipeline;
pub mod store;
pub mod su;
pub mod telemetry;
pub mod wasm;
pub mod workers;
