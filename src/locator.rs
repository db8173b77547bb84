//! Scheduler location resolution, batched per tick.
//!
//! Every pipeline run asks where a process's scheduler lives. Concurrent
//! lookups for the same process inside one short batch window coalesce into
//! a single upstream call whose result fans out to every waiter; the window
//! cache dies with the batch, so nothing served from it can go stale. The
//! upstream resolver keeps its own long-lived cache.

use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::json;
use tokio::sync::oneshot;
use tracing::instrument;

use crate::model::Tag;

/// How long concurrent lookups coalesce before the upstream call fires.
pub const BATCH_WINDOW: Duration = Duration::from_millis(1);

/// Errors are cloneable so one upstream failure can fan out to a batch.
#[derive(Debug, Clone, thiserror::Error, miette::Diagnostic)]
pub enum LocatorError {
    #[error("scheduler lookup failed: {0}")]
    #[diagnostic(
        code(cueval::locator::http),
        help("Transient gateway failure; retry the read.")
    )]
    Http(String),

    #[error("no scheduler registered for process {process_id}")]
    #[diagnostic(code(cueval::locator::unregistered))]
    Unregistered { process_id: String },

    #[error("locator response malformed: {0}")]
    #[diagnostic(code(cueval::locator::shape))]
    BadResponse(String),
}

/// Where a process's scheduler lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessLocation {
    pub su_url: String,
    /// The scheduler's on-chain address.
    pub address: String,
}

/// Raw, uncoalesced location lookup.
#[async_trait]
pub trait SchedulerLocator: Send + Sync {
    async fn locate(&self, process_id: &str) -> Result<ProcessLocation, LocatorError>;
}

type Waiter = oneshot::Sender<Result<ProcessLocation, LocatorError>>;

/// Request-coalescing front for a [`SchedulerLocator`].
#[derive(Clone)]
pub struct BatchedLocator {
    inner: Arc<dyn SchedulerLocator>,
    window: Duration,
    pending: Arc<Mutex<FxHashMap<String, Vec<Waiter>>>>,
}

impl BatchedLocator {
    pub fn new(inner: Arc<dyn SchedulerLocator>) -> Self {
        Self::with_window(inner, BATCH_WINDOW)
    }

    pub fn with_window(inner: Arc<dyn SchedulerLocator>, window: Duration) -> Self {
        Self {
            inner,
            window,
            pending: Arc::new(Mutex::new(FxHashMap::default())),
        }
    }

    /// Resolve a process's scheduler, joining any batch already forming.
    #[instrument(skip(self), err)]
    pub async fn locate(&self, process_id: &str) -> Result<ProcessLocation, LocatorError> {
        let (tx, rx) = oneshot::channel();
        let leads_batch = {
            let mut pending = self.pending.lock();
            match pending.entry(process_id.to_string()) {
                Entry::Occupied(mut waiters) => {
                    waiters.get_mut().push(tx);
                    false
                }
                Entry::Vacant(slot) => {
                    slot.insert(vec![tx]);
                    true
                }
            }
        };

        if leads_batch {
            let inner = self.inner.clone();
            let pending = self.pending.clone();
            let window = self.window;
            let process_id = process_id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(window).await;
                // Removing the entry ends the batch; later callers start a new one.
                let waiters = pending.lock().remove(&process_id).unwrap_or_default();
                let result = inner.locate(&process_id).await;
                for waiter in waiters {
                    let _ = waiter.send(result.clone());
                }
            });
        }

        rx.await
            .map_err(|_| LocatorError::BadResponse("locator batch dropped".into()))?
    }
}

/// Gateway-backed resolver: the process's `Scheduler` tag names an address
/// whose latest `Scheduler-Location` record carries the URL.
pub struct GatewayLocator {
    http: reqwest::Client,
    graphql_url: String,
    cache: Mutex<FxHashMap<String, ProcessLocation>>,
}

impl GatewayLocator {
    pub fn new(graphql_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            graphql_url: graphql_url.into(),
            cache: Mutex::new(FxHashMap::default()),
        }
    }

    async fn query_tags(&self, body: serde_json::Value) -> Result<Vec<Tag>, LocatorError> {
        #[derive(serde::Deserialize)]
        struct Resp {
            data: Option<Data>,
        }
        #[derive(serde::Deserialize)]
        struct Data {
            transactions: Conn,
        }
        #[derive(serde::Deserialize)]
        struct Conn {
            edges: Vec<Edge>,
        }
        #[derive(serde::Deserialize)]
        struct Edge {
            node: Node,
        }
        #[derive(serde::Deserialize)]
        struct Node {
            tags: Vec<Tag>,
        }

        let resp: Resp = self
            .http
            .post(&self.graphql_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| LocatorError::Http(e.to_string()))?
            .error_for_status()
            .map_err(|e| LocatorError::Http(e.to_string()))?
            .json()
            .await
            .map_err(|e| LocatorError::Http(e.to_string()))?;

        let mut edges = resp
            .data
            .ok_or_else(|| LocatorError::BadResponse("missing data".into()))?
            .transactions
            .edges;
        if edges.is_empty() {
            return Ok(vec![]);
        }
        Ok(edges.swap_remove(0).node.tags)
    }
}

#[async_trait]
impl SchedulerLocator for GatewayLocator {
    async fn locate(&self, process_id: &str) -> Result<ProcessLocation, LocatorError> {
        if let Some(hit) = self.cache.lock().get(process_id) {
            return Ok(hit.clone());
        }

        let process_tags = self
            .query_tags(json!({
                "query": "query ($ids: [ID!]) { transactions(ids: $ids, first: 1) { edges { node { tags { name value } } } } }",
                "variables": { "ids": [process_id] }
            }))
            .await?;
        let address = crate::model::tag_value(&process_tags, "Scheduler")
            .ok_or_else(|| LocatorError::Unregistered {
                process_id: process_id.to_string(),
            })?
            .to_string();

        let location_tags = self
            .query_tags(json!({
                "query": "query ($owners: [String!]) { transactions(owners: $owners, tags: [{ name: \"Type\", values: [\"Scheduler-Location\"] }], first: 1, sort: HEIGHT_DESC) { edges { node { tags { name value } } } } }",
                "variables": { "owners": [address] }
            }))
            .await?;
        let su_url = crate::model::tag_value(&location_tags, "Url")
            .ok_or_else(|| LocatorError::Unregistered {
                process_id: process_id.to_string(),
            })?
            .trim_end_matches('/')
            .to_string();

        let location = ProcessLocation { su_url, address };
        self.cache
            .lock()
            .insert(process_id.to_string(), location.clone());
        Ok(location)
    }
}
