//! Dedicated-thread evaluation pool.
//!
//! Each worker is an OS thread that owns its compiled-module cache and
//! pulls work from a shared channel; results come back on one-shot
//! channels. Buffers are moved into the request and returned in the
//! outcome, so workers and the orchestrator never share mutable memory.
//! FIFO across processes is not guaranteed; per-process ordering comes from
//! the pipeline awaiting each result before submitting the next.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use lru::LruCache;
use tracing::instrument;

use crate::wasm::{CompiledModule, EvalOutcome, EvalRequest, WasmError, WasmRuntime};

use super::WorkerInit;

#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum PoolError {
    #[error("worker pool shut down")]
    #[diagnostic(code(cueval::workers::pool_closed))]
    Closed,

    #[error(transparent)]
    #[diagnostic(transparent)]
    Wasm(#[from] WasmError),
}

struct WorkItem {
    request: EvalRequest,
    reply: tokio::sync::oneshot::Sender<Result<EvalOutcome, WasmError>>,
}

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub active: usize,
    pub idle: usize,
    /// Items accepted by the pool but not yet picked up by a worker.
    pub pending_tasks: usize,
}

/// A fixed-size pool of evaluation threads.
pub struct WorkerPool {
    tx: flume::Sender<WorkItem>,
    size: usize,
    active: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Spawn `size` named worker threads sharing one work channel.
    pub fn new(name: &str, size: usize, runtime: Arc<dyn WasmRuntime>, init: WorkerInit) -> Self {
        let size = size.max(1);
        let (tx, rx) = flume::unbounded::<WorkItem>();
        let active = Arc::new(AtomicUsize::new(0));

        for index in 0..size {
            let rx = rx.clone();
            let runtime = runtime.clone();
            let active = active.clone();
            let mut init = init.clone();
            init.worker_id = format!("{}-{}-{index}", name, uuid::Uuid::new_v4().simple());
            let thread_name = format!("cu-{name}-worker-{index}");
            std::thread::Builder::new()
                .name(thread_name)
                .spawn(move || worker_loop(rx, runtime, init, active))
                .expect("worker thread spawn");
        }

        Self { tx, size, active }
    }

    /// Submit one evaluation and await its outcome.
    #[instrument(skip(self, request), fields(process_id = %request.process_id))]
    pub async fn evaluate(&self, request: EvalRequest) -> Result<EvalOutcome, PoolError> {
        let (reply, response) = tokio::sync::oneshot::channel();
        self.tx
            .send_async(WorkItem { request, reply })
            .await
            .map_err(|_| PoolError::Closed)?;
        match response.await {
            Ok(outcome) => Ok(outcome?),
            Err(_) => Err(PoolError::Closed),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn stats(&self) -> PoolStats {
        let active = self.active.load(Ordering::Relaxed).min(self.size);
        PoolStats {
            active,
            idle: self.size - active,
            pending_tasks: self.tx.len(),
        }
    }
}

fn worker_loop(
    rx: flume::Receiver<WorkItem>,
    runtime: Arc<dyn WasmRuntime>,
    init: WorkerInit,
    active: Arc<AtomicUsize>,
) {
    runtime.worker_boot(&init);
    let cache_size = NonZeroUsize::new(init.module_cache_max_size.max(1)).unwrap();
    let mut modules: LruCache<String, Box<dyn CompiledModule>> = LruCache::new(cache_size);

    // Exits when the pool (every sender) is dropped.
    while let Ok(item) = rx.recv() {
        active.fetch_add(1, Ordering::Relaxed);
        let module_id = item.request.module_id.clone();

        if !modules.contains(&module_id) {
            match runtime.compile(
                &module_id,
                &item.request.binary,
                &item.request.options,
                init.instance_cache_max_size,
            ) {
                Ok(compiled) => {
                    modules.put(module_id.clone(), compiled);
                }
                Err(e) => {
                    let _ = item.reply.send(Err(e));
                    active.fetch_sub(1, Ordering::Relaxed);
                    continue;
                }
            }
        }
        let compiled = modules.get_mut(&module_id).expect("module just cached");
        let outcome = compiled.evaluate(item.request);
        // A caller that stopped waiting just discards the result.
        let _ = item.reply.send(Ok(outcome));
        active.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EvalOutput, ModuleOptions, ScheduledMessage};
    use crate::ordinate::Ordinate;
    use bytes::Bytes;

    /// Appends the message ordinate to the memory; deterministic and cheap.
    struct AppendingModule;

    impl CompiledModule for AppendingModule {
        fn evaluate(&mut self, request: EvalRequest) -> EvalOutcome {
            let mut memory = request.memory.to_vec();
            memory.extend_from_slice(request.message.ordinate.as_str().as_bytes());
            EvalOutcome {
                memory: Bytes::from(memory),
                output: EvalOutput::default(),
                gas_used: 7,
            }
        }
    }

    struct AppendingRuntime {
        compiles: AtomicUsize,
    }

    impl WasmRuntime for AppendingRuntime {
        fn compile(
            &self,
            _module_id: &str,
            _binary: &Bytes,
            _options: &ModuleOptions,
            _instance_cache_max_size: usize,
        ) -> Result<Box<dyn CompiledModule>, WasmError> {
            self.compiles.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(AppendingModule))
        }
    }

    fn message(ordinate: u64) -> ScheduledMessage {
        ScheduledMessage {
            ordinate: Ordinate::from_int(ordinate),
            message_id: Some(format!("m{ordinate}")),
            is_assignment: false,
            cron: None,
            tags: vec![],
            data: None,
            block_height: 1,
            timestamp: 1,
            epoch: None,
            nonce: None,
            deep_hash: None,
        }
    }

    fn request(ordinate: u64, memory: &[u8]) -> EvalRequest {
        EvalRequest {
            process_id: "p-1".into(),
            module_id: "mod-1".into(),
            binary: Bytes::from_static(b"\0asm"),
            options: ModuleOptions::default(),
            memory: Bytes::copy_from_slice(memory),
            message: message(ordinate),
        }
    }

    #[tokio::test]
    async fn evaluations_flow_through_one_worker() {
        let runtime = Arc::new(AppendingRuntime {
            compiles: AtomicUsize::new(0),
        });
        let init = WorkerInit {
            module_cache_max_size: 2,
            instance_cache_max_size: 2,
            binary_dir: std::env::temp_dir(),
            network_url: String::new(),
            store_path: String::new(),
            worker_id: String::new(),
        };
        let pool = WorkerPool::new("test", 1, runtime.clone(), init);

        let out1 = pool.evaluate(request(1, b"")).await.unwrap();
        assert_eq!(out1.memory.as_ref(), b"1");
        let out2 = pool.evaluate(request(2, &out1.memory)).await.unwrap();
        assert_eq!(out2.memory.as_ref(), b"12");
        assert_eq!(out2.gas_used, 7);
        // One worker, one module: compiled exactly once.
        assert_eq!(runtime.compiles.load(Ordering::SeqCst), 1);

        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.pending_tasks, 0);
    }
}
