#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::json;

use cueval::checkpoint::{CheckpointNetwork, GatewayError, SignedDataItem, hash_memory, tags};
use cueval::locator::{LocatorError, ProcessLocation, SchedulerLocator};
use cueval::model::{
    EvalOutput, MessageMeta, ModuleOptions, Process, RemoteCheckpoint, ScheduledMessage,
    tag_value,
};
use cueval::ordinate::Ordinate;
use cueval::su::{MessageBound, MessageStream, SchedulerUnit, SuError, SuTimestamp};
use cueval::wasm::{CompiledModule, EvalOutcome, EvalRequest, WasmError, WasmRuntime};

/// Deterministic stand-in for a WASM engine: the next memory is the prior
/// memory with the message ordinate appended, gas comes from a `Gas` tag
/// (default 10), and a `Fail` tag produces a process-level error payload.
pub struct StubRuntime {
    pub compiles: AtomicUsize,
    /// Evaluations block on this signal when set, to hold workers busy.
    pub gate: Mutex<Option<flume::Receiver<()>>>,
}

impl Default for StubRuntime {
    fn default() -> Self {
        Self {
            compiles: AtomicUsize::new(0),
            gate: Mutex::new(None),
        }
    }
}

impl StubRuntime {
    pub fn gated() -> (Arc<Self>, flume::Sender<()>) {
        let (tx, rx) = flume::unbounded();
        let runtime = Arc::new(Self {
            compiles: AtomicUsize::new(0),
            gate: Mutex::new(Some(rx)),
        });
        (runtime, tx)
    }
}

struct StubModule {
    gate: Option<flume::Receiver<()>>,
}

impl CompiledModule for StubModule {
    fn evaluate(&mut self, request: EvalRequest) -> EvalOutcome {
        if let Some(gate) = &self.gate {
            let _ = gate.recv();
        }
        let mut memory = request.memory.to_vec();
        memory.extend_from_slice(request.message.ordinate.as_str().as_bytes());
        let gas_used = tag_value(&request.message.tags, "Gas")
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);
        let error = tag_value(&request.message.tags, "Fail")
            .map(|reason| json!({ "error": reason }));
        EvalOutcome {
            memory: Bytes::from(memory),
            output: EvalOutput {
                data: Some(json!({ "echo": request.message.ordinate.as_str() })),
                error,
                ..EvalOutput::default()
            },
            gas_used,
        }
    }
}

impl WasmRuntime for StubRuntime {
    fn compile(
        &self,
        _module_id: &str,
        _binary: &Bytes,
        _options: &ModuleOptions,
        _instance_cache_max_size: usize,
    ) -> Result<Box<dyn CompiledModule>, WasmError> {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(StubModule {
            gate: self.gate.lock().clone(),
        }))
    }
}

/// In-process Scheduler Unit with per-process message logs.
#[derive(Default)]
pub struct FakeSu {
    processes: Mutex<FxHashMap<String, Process>>,
    messages: Mutex<FxHashMap<String, Vec<ScheduledMessage>>>,
    metas: Mutex<FxHashMap<String, MessageMeta>>,
    pub message_stream_opens: AtomicUsize,
    /// Delay before each yielded message, to widen single-flight windows.
    pub per_message_delay: Mutex<Duration>,
}

impl FakeSu {
    pub fn set_process(&self, process: Process) {
        self.processes.lock().insert(process.id.clone(), process);
    }

    pub fn set_messages(&self, process_id: &str, messages: Vec<ScheduledMessage>) {
        for message in &messages {
            if let Some(id) = &message.message_id {
                self.metas.lock().insert(
                    id.clone(),
                    MessageMeta {
                        process_id: process_id.to_string(),
                        timestamp: message.timestamp,
                        epoch: message.epoch,
                        nonce: message.nonce,
                        ordinate: message.ordinate.clone(),
                    },
                );
            }
        }
        self.messages
            .lock()
            .insert(process_id.to_string(), messages);
    }

    pub fn stream_opens(&self) -> usize {
        self.message_stream_opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SchedulerUnit for FakeSu {
    async fn load_process(&self, _su_url: &str, process_id: &str) -> Result<Process, SuError> {
        self.processes
            .lock()
            .get(process_id)
            .cloned()
            .ok_or_else(|| SuError::NotFound {
                what: format!("process {process_id}"),
            })
    }

    async fn load_timestamp(
        &self,
        _su_url: &str,
        process_id: &str,
    ) -> Result<SuTimestamp, SuError> {
        let last = self
            .messages
            .lock()
            .get(process_id)
            .and_then(|m| m.last().cloned());
        Ok(SuTimestamp {
            block_height: last.as_ref().map(|m| m.block_height).unwrap_or(0),
            timestamp: last.map(|m| m.timestamp).unwrap_or(0),
        })
    }

    async fn load_message_meta(
        &self,
        _su_url: &str,
        _process_id: &str,
        message_id: &str,
    ) -> Result<MessageMeta, SuError> {
        self.metas
            .lock()
            .get(message_id)
            .cloned()
            .ok_or_else(|| SuError::NotFound {
                what: format!("message {message_id}"),
            })
    }

    fn load_messages(
        &self,
        _su_url: &str,
        process_id: &str,
        from: Ordinate,
        bound: MessageBound,
    ) -> MessageStream {
        self.message_stream_opens.fetch_add(1, Ordering::SeqCst);
        let delay = *self.per_message_delay.lock();
        let messages: Vec<ScheduledMessage> = self
            .messages
            .lock()
            .get(process_id)
            .map(|all| {
                all.iter()
                    .filter(|m| m.ordinate > from && bound.admits(m))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        futures_util::stream::iter(messages)
            .then(move |message| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(message)
            })
            .boxed()
    }
}

/// Fixed-location scheduler resolver.
pub struct FakeLocator {
    pub calls: AtomicUsize,
}

impl Default for FakeLocator {
    fn default() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SchedulerLocator for FakeLocator {
    async fn locate(&self, _process_id: &str) -> Result<ProcessLocation, LocatorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ProcessLocation {
            su_url: "http://su.test".into(),
            address: "sched-addr".into(),
        })
    }
}

/// In-memory content-addressed network with upload capture.
#[derive(Default)]
pub struct FakeNetwork {
    pub checkpoints: Mutex<Vec<RemoteCheckpoint>>,
    pub payloads: Mutex<FxHashMap<String, Bytes>>,
    pub uploads: Mutex<Vec<SignedDataItem>>,
    pub queries: AtomicUsize,
    pub downloads: AtomicUsize,
}

impl FakeNetwork {
    /// Register a remote checkpoint with a consistent digest tag.
    pub fn add_checkpoint(
        &self,
        tx_id: &str,
        owner: &str,
        process_id: &str,
        module_id: &str,
        ordinate: Ordinate,
        timestamp: i64,
        payload: Bytes,
    ) {
        self.checkpoints.lock().push(RemoteCheckpoint {
            tx_id: tx_id.to_string(),
            owner: owner.to_string(),
            process_id: process_id.to_string(),
            module_id: module_id.to_string(),
            ordinate,
            timestamp,
            block_height: 1,
            epoch: None,
            nonce: None,
            memory_hash: hash_memory(&payload),
        });
        self.payloads.lock().insert(tx_id.to_string(), payload);
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CheckpointNetwork for FakeNetwork {
    async fn query_checkpoints(
        &self,
        process_id: &str,
        owners: &[String],
    ) -> Result<Vec<RemoteCheckpoint>, GatewayError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .checkpoints
            .lock()
            .iter()
            .filter(|c| c.process_id == process_id && owners.contains(&c.owner))
            .cloned()
            .collect())
    }

    async fn download(&self, tx_id: &str) -> Result<Bytes, GatewayError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        self.payloads
            .lock()
            .get(tx_id)
            .cloned()
            .ok_or_else(|| GatewayError::BadResponse(format!("unknown tx {tx_id}")))
    }

    async fn upload(&self, item: &SignedDataItem) -> Result<String, GatewayError> {
        let tx_id = format!("tx-{}", self.uploads.lock().len() + 1);
        let process = tag_value(&item.tags, tags::PROCESS).unwrap_or("").to_string();
        let ordinate = tag_value(&item.tags, tags::ORDINATE).unwrap_or("").to_string();
        let timestamp: i64 = tag_value(&item.tags, tags::TIMESTAMP)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        use base64::Engine as _;
        let payload = Bytes::from(
            base64::engine::general_purpose::STANDARD
                .decode(&item.data)
                .unwrap_or_default(),
        );
        self.checkpoints.lock().push(RemoteCheckpoint {
            tx_id: tx_id.clone(),
            owner: item.owner.clone(),
            process_id: process,
            module_id: tag_value(&item.tags, tags::MODULE).unwrap_or("").to_string(),
            ordinate: Ordinate::new(ordinate),
            timestamp,
            block_height: 1,
            epoch: None,
            nonce: None,
            memory_hash: hash_memory(&payload),
        });
        self.payloads.lock().insert(tx_id.clone(), payload);
        self.uploads.lock().push(item.clone());
        Ok(tx_id)
    }
}
