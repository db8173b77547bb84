//! Module binary fetch and cache.

use std::num::NonZeroUsize;
use std::path::PathBuf;

use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use serde_json::json;
use tracing::instrument;

use crate::model::{ModuleFormat, ModuleMeta, ModuleOptions, Tag, tag_value};

use super::WasmError;

/// Fetches module binaries, preferring memory, then disk, then the network.
///
/// Network fetches are persisted to `binary_dir` so restarts do not refetch,
/// and the in-memory tier is a small LRU sized by configuration. Module
/// metadata (format, limits, extensions) resolves from the module
/// transaction's tags on the gateway.
pub struct ModuleLoader {
    http: reqwest::Client,
    arweave_url: String,
    graphql_url: String,
    binary_dir: PathBuf,
    cache: Mutex<LruCache<String, Bytes>>,
}

impl std::fmt::Debug for ModuleLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleLoader")
            .field("binary_dir", &self.binary_dir)
            .finish()
    }
}

impl ModuleLoader {
    pub fn new(
        arweave_url: impl Into<String>,
        graphql_url: impl Into<String>,
        binary_dir: impl Into<PathBuf>,
        cache_max_entries: usize,
    ) -> std::io::Result<Self> {
        let binary_dir = binary_dir.into();
        std::fs::create_dir_all(&binary_dir)?;
        Ok(Self {
            http: reqwest::Client::new(),
            arweave_url: arweave_url.into(),
            graphql_url: graphql_url.into(),
            binary_dir,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(cache_max_entries.max(1)).unwrap(),
            )),
        })
    }

    /// Module metadata from the gateway, for modules the store has not seen.
    #[instrument(skip(self), err)]
    pub async fn load_module_meta(&self, module_id: &str) -> Result<ModuleMeta, WasmError> {
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
            owner: Owner,
            tags: Vec<Tag>,
        }
        #[derive(serde::Deserialize)]
        struct Owner {
            address: String,
        }

        let body = json!({
            "query": "query ($ids: [ID!]) { transactions(ids: $ids, first: 1) { edges { node { owner { address } tags { name value } } } } }",
            "variables": { "ids": [module_id] }
        });
        let resp: Resp = self
            .http
            .post(&self.graphql_url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let node = resp
            .data
            .and_then(|d| d.transactions.edges.into_iter().next())
            .map(|e| e.node)
            .ok_or_else(|| WasmError::Inadmissible {
                module_id: module_id.to_string(),
                reason: "module transaction not found".into(),
            })?;

        let format = tag_value(&node.tags, "Module-Format")
            .ok_or_else(|| WasmError::Inadmissible {
                module_id: module_id.to_string(),
                reason: "module has no Module-Format tag".into(),
            })?
            .to_string();
        let options = ModuleOptions {
            memory_limit: tag_value(&node.tags, "Memory-Limit")
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
            compute_limit: tag_value(&node.tags, "Compute-Limit")
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
            extensions: node
                .tags
                .iter()
                .filter(|t| t.name == "Extension")
                .map(|t| t.value.clone())
                .collect(),
        };
        Ok(ModuleMeta {
            id: module_id.to_string(),
            owner: node.owner.address,
            format: ModuleFormat(format),
            options,
            tags: node.tags,
        })
    }

    /// Raw module binary by id.
    #[instrument(skip(self), err)]
    pub async fn load_module(&self, module_id: &str) -> Result<Bytes, WasmError> {
        if let Some(bytes) = self.cache.lock().get(module_id) {
            return Ok(bytes.clone());
        }

        let path = self.binary_dir.join(module_id);
        if let Ok(bytes) = tokio::fs::read(&path).await {
            let bytes = Bytes::from(bytes);
            self.cache.lock().put(module_id.to_string(), bytes.clone());
            return Ok(bytes);
        }

        let url = format!("{}/{module_id}", self.arweave_url.trim_end_matches('/'));
        let bytes = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        // Persist for the next cold start; a write failure only costs a refetch.
        if let Err(e) = tokio::fs::write(&path, &bytes).await {
            tracing::warn!(module_id, error = %e, "module binary not persisted to disk");
        }
        self.cache.lock().put(module_id.to_string(), bytes.clone());
        Ok(bytes)
    }
}
