//! Checkpoint discovery and transfer on the content-addressed network.
//!
//! Discovery is a GraphQL tag-equality query against the gateway; payloads
//! download straight from the network by tx id; uploads go through the
//! bundler. The trait seam keeps the wire format out of the find/save
//! pipelines and lets tests substitute an in-process network.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use tracing::instrument;

use crate::model::{RemoteCheckpoint, Tag};
use crate::ordinate::Ordinate;

use super::bundle::SignedDataItem;

#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum GatewayError {
    #[error("gateway request failed: {0}")]
    #[diagnostic(
        code(cueval::checkpoint::gateway_http),
        help("Transient network failure; the pipeline falls back to other tiers.")
    )]
    Http(#[from] reqwest::Error),

    #[error("gateway response malformed: {0}")]
    #[diagnostic(code(cueval::checkpoint::gateway_shape))]
    BadResponse(String),
}

/// Network operations the checkpoint pipelines depend on.
#[async_trait]
pub trait CheckpointNetwork: Send + Sync {
    /// Checkpoint descriptors for a process, restricted to the given
    /// owners. Order is unspecified; callers pick by ordinate.
    async fn query_checkpoints(
        &self,
        process_id: &str,
        owners: &[String],
    ) -> Result<Vec<RemoteCheckpoint>, GatewayError>;

    /// Fetch a checkpoint payload by tx id.
    async fn download(&self, tx_id: &str) -> Result<Bytes, GatewayError>;

    /// Upload a signed data item; returns the assigned tx id.
    async fn upload(&self, item: &SignedDataItem) -> Result<String, GatewayError>;
}

/// Production implementation over HTTP.
#[derive(Debug, Clone)]
pub struct HttpCheckpointNetwork {
    http: reqwest::Client,
    checkpoint_gateway_url: String,
    arweave_url: String,
    uploader_url: String,
}

impl HttpCheckpointNetwork {
    pub fn new(
        checkpoint_gateway_url: impl Into<String>,
        arweave_url: impl Into<String>,
        uploader_url: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            checkpoint_gateway_url: checkpoint_gateway_url.into(),
            arweave_url: arweave_url.into(),
            uploader_url: uploader_url.into(),
        }
    }
}

const CHECKPOINT_QUERY: &str = r#"
query ($processes: [String!]!, $owners: [String!], $first: Int!) {
  transactions(
    tags: [
      { name: "Type", values: ["Checkpoint"] }
      { name: "Process", values: $processes }
    ]
    owners: $owners
    first: $first
    sort: HEIGHT_DESC
  ) {
    edges {
      node {
        id
        owner { address }
        tags { name value }
      }
    }
  }
}
"#;

#[derive(Deserialize)]
struct GraphQlResponse {
    data: Option<TransactionsData>,
    #[serde(default)]
    errors: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
struct TransactionsData {
    transactions: Connection,
}

#[derive(Deserialize)]
struct Connection {
    edges: Vec<Edge>,
}

#[derive(Deserialize)]
struct Edge {
    node: Node,
}

#[derive(Deserialize)]
struct Node {
    id: String,
    owner: Owner,
    tags: Vec<Tag>,
}

#[derive(Deserialize)]
struct Owner {
    address: String,
}

#[async_trait]
impl CheckpointNetwork for HttpCheckpointNetwork {
    #[instrument(skip(self, owners), err)]
    async fn query_checkpoints(
        &self,
        process_id: &str,
        owners: &[String],
    ) -> Result<Vec<RemoteCheckpoint>, GatewayError> {
        let body = json!({
            "query": CHECKPOINT_QUERY,
            "variables": {
                "processes": [process_id],
                "owners": owners,
                "first": 50,
            }
        });
        let resp: GraphQlResponse = self
            .http
            .post(&self.checkpoint_gateway_url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if !resp.errors.is_empty() {
            return Err(GatewayError::BadResponse(format!(
                "graphql errors: {}",
                serde_json::Value::Array(resp.errors)
            )));
        }
        let data = resp
            .data
            .ok_or_else(|| GatewayError::BadResponse("missing data".into()))?;
        Ok(data
            .transactions
            .edges
            .into_iter()
            .filter_map(|edge| node_to_checkpoint(edge.node, process_id))
            .collect())
    }

    #[instrument(skip(self), err)]
    async fn download(&self, tx_id: &str) -> Result<Bytes, GatewayError> {
        let url = format!("{}/{tx_id}", self.arweave_url.trim_end_matches('/'));
        Ok(self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?)
    }

    #[instrument(skip(self, item), err)]
    async fn upload(&self, item: &SignedDataItem) -> Result<String, GatewayError> {
        #[derive(Deserialize)]
        struct UploadResponse {
            id: String,
        }
        let url = format!("{}/tx", self.uploader_url.trim_end_matches('/'));
        let resp: UploadResponse = self
            .http
            .post(&url)
            .json(item)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp.id)
    }
}

/// Tag names a checkpoint data item carries.
pub mod tags {
    pub const TYPE: &str = "Type";
    pub const PROCESS: &str = "Process";
    pub const MODULE: &str = "Module";
    pub const ORDINATE: &str = "Ordinate";
    pub const TIMESTAMP: &str = "Timestamp";
    pub const BLOCK_HEIGHT: &str = "Block-Height";
    pub const EPOCH: &str = "Epoch";
    pub const NONCE: &str = "Nonce";
    pub const MEMORY_DIGEST: &str = "SHA-256";
}

fn node_to_checkpoint(node: Node, process_id: &str) -> Option<RemoteCheckpoint> {
    let find = |name: &str| crate::model::tag_value(&node.tags, name).map(str::to_string);
    // A descriptor missing its required tags is skipped, not fatal.
    Some(RemoteCheckpoint {
        tx_id: node.id,
        owner: node.owner.address,
        process_id: process_id.to_string(),
        module_id: find(tags::MODULE)?,
        ordinate: Ordinate::new(find(tags::ORDINATE)?),
        timestamp: find(tags::TIMESTAMP)?.parse().ok()?,
        block_height: find(tags::BLOCK_HEIGHT)
            .and_then(|v| v.parse().ok())
            .unwrap_or_default(),
        epoch: find(tags::EPOCH).and_then(|v| v.parse().ok()),
        nonce: find(tags::NONCE).and_then(|v| v.parse().ok()),
        memory_hash: find(tags::MEMORY_DIGEST)?,
    })
}
