//! Shared data model for the evaluation core.
//!
//! These types are the currency between the store, the caches, the
//! Scheduler Unit client, and the pipeline. Persisted shapes live next to
//! the store; everything here is the in-memory form.

use std::path::PathBuf;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ordinate::Ordinate;

/// A name/value pair attached to processes, modules, and checkpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    pub value: String,
}

impl Tag {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Find the value of the first tag with the given name.
pub fn tag_value<'a>(tags: &'a [Tag], name: &str) -> Option<&'a str> {
    tags.iter()
        .find(|t| t.name == name)
        .map(|t| t.value.as_str())
}

/// Block height and timestamp at which something was anchored on chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BlockRef {
    pub height: u64,
    /// Milliseconds since the epoch.
    pub timestamp: i64,
}

/// A deterministic WASM process. Immutable after first persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Process {
    pub id: String,
    pub owner: String,
    pub tags: Vec<Tag>,
    pub signature: String,
    pub block: BlockRef,
    pub module_id: String,
}

/// Module binary format identifier, e.g. `wasm32-unknown-emscripten`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleFormat(pub String);

impl ModuleFormat {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Execution options carried by a module's metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ModuleOptions {
    /// Maximum linear memory in bytes.
    pub memory_limit: u64,
    /// Maximum gas per message.
    pub compute_limit: u64,
    /// Host extensions the module requires.
    #[serde(default)]
    pub extensions: Vec<String>,
}

/// A WASM module shared by one or more processes. Immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleMeta {
    pub id: String,
    pub owner: String,
    pub tags: Vec<Tag>,
    pub format: ModuleFormat,
    pub options: ModuleOptions,
}

/// The outbox produced by evaluating one message.
///
/// Values are preserved verbatim from the evaluator; the core never
/// interprets them beyond persistence and readback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EvalOutput {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub spawns: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assignments: Vec<Value>,
    /// Free-form output data (console output, return value).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Error reported by the evaluator itself. An errored evaluation is
    /// still a persisted evaluation; the pipeline advances past it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

/// One persisted state transition. Append-only, keyed by
/// `(process_id, ordinate, cron, timestamp)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub process_id: String,
    pub ordinate: Ordinate,
    /// Cron interval identity when the message was synthetic, else `None`.
    pub cron: Option<String>,
    /// Milliseconds since the epoch.
    pub timestamp: i64,
    pub block_height: u64,
    /// Absent for cron evaluations.
    pub message_id: Option<String>,
    /// Dedup identity for cranked messages, when present.
    pub deep_hash: Option<String>,
    pub epoch: Option<u64>,
    pub nonce: Option<u64>,
    pub output: EvalOutput,
    pub gas_used: u64,
}

impl Evaluation {
    /// The memory origin a buffer produced by this evaluation carries.
    pub fn memory_origin(&self) -> MemoryOrigin {
        MemoryOrigin {
            process_id: self.process_id.clone(),
            ordinate: self.ordinate.clone(),
            timestamp: self.timestamp,
            block_height: self.block_height,
            epoch: self.epoch,
            nonce: self.nonce,
            cron: self.cron.clone(),
        }
    }
}

/// Where a process memory buffer currently lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryPayload {
    /// Live bytes in the cache tier.
    Loaded(Bytes),
    /// Spilled to a file; consumers rehydrate by reading it.
    Spilled(PathBuf),
}

impl MemoryPayload {
    /// Size of the live payload; spilled entries account as zero in the
    /// cache byte budget.
    pub fn resident_bytes(&self) -> usize {
        match self {
            MemoryPayload::Loaded(b) => b.len(),
            MemoryPayload::Spilled(_) => 0,
        }
    }
}

/// The evaluation a memory buffer corresponds to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryOrigin {
    pub process_id: String,
    pub ordinate: Ordinate,
    pub timestamp: i64,
    pub block_height: u64,
    pub epoch: Option<u64>,
    pub nonce: Option<u64>,
    pub cron: Option<String>,
}

impl MemoryOrigin {
    /// The cold-start origin for a process with no history.
    pub fn cold_start(process_id: impl Into<String>) -> Self {
        Self {
            process_id: process_id.into(),
            ordinate: Ordinate::ZERO,
            timestamp: 0,
            block_height: 0,
            epoch: None,
            nonce: None,
            cron: None,
        }
    }
}

/// A process memory buffer plus the evaluation it corresponds to.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessMemory {
    pub memory: MemoryPayload,
    pub module_id: String,
    pub origin: MemoryOrigin,
    /// Gas accumulated since the last checkpoint of this process.
    pub gas_used: u64,
}

impl ProcessMemory {
    pub fn cold_start(process_id: impl Into<String>, module_id: impl Into<String>) -> Self {
        let process_id = process_id.into();
        Self {
            memory: MemoryPayload::Loaded(Bytes::new()),
            module_id: module_id.into(),
            origin: MemoryOrigin::cold_start(process_id),
            gas_used: 0,
        }
    }
}

/// One message from the Scheduler Unit's ordered log.
///
/// Synthetic cron messages interleave with user messages by timestamp and
/// carry `cron: Some(..)` with no `message_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledMessage {
    pub ordinate: Ordinate,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub is_assignment: bool,
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default)]
    pub data: Option<Value>,
    pub block_height: u64,
    pub timestamp: i64,
    #[serde(default)]
    pub epoch: Option<u64>,
    #[serde(default)]
    pub nonce: Option<u64>,
    /// Dedup identity computed upstream for cranked user messages.
    #[serde(default)]
    pub deep_hash: Option<String>,
}

impl ScheduledMessage {
    pub fn is_cron(&self) -> bool {
        self.cron.is_some()
    }
}

/// Metadata resolving a message id to its position in a process log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageMeta {
    pub process_id: String,
    pub timestamp: i64,
    #[serde(default)]
    pub epoch: Option<u64>,
    #[serde(default)]
    pub nonce: Option<u64>,
    pub ordinate: Ordinate,
}

/// Where a persisted checkpoint lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointLocation {
    /// A file in the local checkpoint directory.
    File(String),
    /// A transaction on the content-addressed network.
    Tx(String),
}

/// Local index row pointing at a checkpoint for fast "before" lookups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub process_id: String,
    pub module_id: String,
    pub ordinate: Ordinate,
    pub timestamp: i64,
    pub block_height: u64,
    pub epoch: Option<u64>,
    pub nonce: Option<u64>,
    pub location: CheckpointLocation,
}

/// A checkpoint discovered on the content-addressed network.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCheckpoint {
    pub tx_id: String,
    pub owner: String,
    pub process_id: String,
    pub module_id: String,
    pub ordinate: Ordinate,
    pub timestamp: i64,
    pub block_height: u64,
    pub epoch: Option<u64>,
    pub nonce: Option<u64>,
    /// Content digest the payload must verify against.
    pub memory_hash: String,
}
