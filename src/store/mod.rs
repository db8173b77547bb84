//! Embedded relational persistence.
//!
//! The store keeps the structured records the pipeline needs to avoid
//! redoing work: processes, modules, evaluations, a block cache, and the
//! local checkpoint index. Everything is keyed so that writes are
//! idempotent and "before" lookups follow the ordinate total order.

mod sqlite;

pub use sqlite::SqliteStore;

use crate::ordinate::{Ordinate, SortOrder};

/// Errors from store operations.
///
/// Misses are `Option::None` at this layer; `StoreError` is reserved for
/// conditions the caller cannot hydrate around.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum StoreError {
    #[error("database error: {0}")]
    #[diagnostic(
        code(cueval::store::sqlx),
        help("Check that the database file is reachable and writable.")
    )]
    Sqlx(#[from] sqlx::Error),

    #[error("corrupt persisted value for {what}: {source}")]
    #[diagnostic(code(cueval::store::corrupt))]
    Corrupt {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Range + shape of an evaluation query.
///
/// `from` is exclusive and `to` inclusive, matching how the pipeline
/// resumes from a known memory: everything strictly after the starting
/// ordinate up to and including the target.
#[derive(Debug, Clone, Default)]
pub struct EvaluationQuery {
    pub from: Option<Ordinate>,
    pub to: Option<Ordinate>,
    pub only_cron: bool,
    pub limit: Option<u32>,
    pub sort: SortOrder,
}

/// Identity probe for duplicate-message detection.
///
/// The dedup identity is `deep_hash` when present, else `message_id`;
/// assigned messages additionally match on `(epoch, nonce)` so the same
/// message assigned twice still evaluates twice.
#[derive(Debug, Clone)]
pub struct MessageBeforeQuery {
    pub process_id: String,
    pub message_id: Option<String>,
    pub deep_hash: Option<String>,
    pub is_assignment: bool,
    pub epoch: Option<u64>,
    pub nonce: Option<u64>,
}

impl MessageBeforeQuery {
    pub fn for_evaluation(eval_process: &str, msg: &crate::model::ScheduledMessage) -> Self {
        Self {
            process_id: eval_process.to_string(),
            message_id: msg.message_id.clone(),
            deep_hash: msg.deep_hash.clone(),
            is_assignment: msg.is_assignment,
            epoch: msg.epoch,
            nonce: msg.nonce,
        }
    }
}

/// Outcome of an idempotent append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Inserted,
    /// The row already existed; append-only tables never overwrite.
    AlreadyPresent,
}
