//! Scheduler Unit client.
//!
//! The SU owns the canonical ordered message log per process. The core
//! consumes it through this seam: process metadata, the authoritative
//! clock, message position lookups, and a lazy paginated message stream.
//! Streams are finite (bounded by the requested target) and not
//! restartable; a consumer that needs to rewind opens a new stream.

mod http;

pub use http::HttpSchedulerUnit;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::model::{MessageMeta, Process, ScheduledMessage};
use crate::ordinate::Ordinate;

#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum SuError {
    #[error("scheduler unit request failed: {0}")]
    #[diagnostic(
        code(cueval::su::http),
        help("Transient SU failure; page fetches retry with bounded backoff.")
    )]
    Http(#[from] reqwest::Error),

    #[error("scheduler unit response malformed: {0}")]
    #[diagnostic(code(cueval::su::shape))]
    BadResponse(String),

    #[error("{what} not found on scheduler unit")]
    #[diagnostic(code(cueval::su::not_found))]
    NotFound { what: String },
}

/// Authoritative current block and time for a process's scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuTimestamp {
    pub block_height: u64,
    pub timestamp: i64,
}

/// Upper bound of a message stream.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBound {
    /// Everything the scheduler has.
    Unbounded,
    /// Up to and including this ordinate.
    Ordinate(Ordinate),
    /// Up to and including this timestamp (cron interleaving uses time).
    Timestamp(i64),
}

impl MessageBound {
    pub fn admits(&self, message: &ScheduledMessage) -> bool {
        match self {
            MessageBound::Unbounded => true,
            MessageBound::Ordinate(to) => message.ordinate <= *to,
            MessageBound::Timestamp(ts) => message.timestamp <= *ts,
        }
    }
}

/// A lazy, ordered, finite sequence of messages.
pub type MessageStream = BoxStream<'static, Result<ScheduledMessage, SuError>>;

/// Operations the core needs from a Scheduler Unit.
///
/// `su_url` is the location resolved per process by the locator; one client
/// serves every scheduler.
#[async_trait]
pub trait SchedulerUnit: Send + Sync {
    async fn load_process(&self, su_url: &str, process_id: &str) -> Result<Process, SuError>;

    async fn load_timestamp(&self, su_url: &str, process_id: &str)
    -> Result<SuTimestamp, SuError>;

    async fn load_message_meta(
        &self,
        su_url: &str,
        process_id: &str,
        message_id: &str,
    ) -> Result<MessageMeta, SuError>;

    /// Messages strictly after `from`, up to `bound`, in ordinate order.
    fn load_messages(
        &self,
        su_url: &str,
        process_id: &str,
        from: Ordinate,
        bound: MessageBound,
    ) -> MessageStream;
}
