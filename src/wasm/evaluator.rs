//! The execution seam between the core and a WASM engine.
//!
//! One message crosses the seam with the memory it applies to; the next
//! memory and the outbox come back. Process-level failures (including out
//! of gas) are data in [`EvalOutput::error`], never a crash of the core:
//! the evaluation row is persisted with the error payload and the pipeline
//! advances.

use bytes::Bytes;

use crate::model::{EvalOutput, ModuleOptions, ScheduledMessage};

use super::WasmError;

/// Everything a worker needs to apply one message.
///
/// The memory buffer is moved in; the orchestrator keeps no live alias to
/// the bytes it hands across.
#[derive(Debug, Clone)]
pub struct EvalRequest {
    pub process_id: String,
    pub module_id: String,
    /// Raw module binary, loaded by [`super::ModuleLoader`].
    pub binary: Bytes,
    pub options: ModuleOptions,
    /// The memory the message applies to.
    pub memory: Bytes,
    pub message: ScheduledMessage,
}

/// Result of applying one message.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalOutcome {
    pub memory: Bytes,
    pub output: EvalOutput,
    pub gas_used: u64,
}

/// A compiled module held in a worker's artifact cache.
///
/// Instances and any engine-internal caches live behind this object; the
/// configured instance-cache size is passed at compile time.
pub trait CompiledModule: Send {
    /// Apply one message. Infallible at the seam: engine traps and
    /// out-of-gas conditions surface in the outcome's `output.error`.
    fn evaluate(&mut self, request: EvalRequest) -> EvalOutcome;
}

/// A WASM engine capable of compiling modules for this CU.
///
/// Implementations are shared across worker threads; the compiled modules
/// they return are thread-local to one worker.
pub trait WasmRuntime: Send + Sync {
    /// Called once per worker thread before any compile.
    fn worker_boot(&self, _init: &crate::workers::WorkerInit) {}

    /// Compile a module binary. Failures are terminal for the module.
    fn compile(
        &self,
        module_id: &str,
        binary: &Bytes,
        options: &ModuleOptions,
        instance_cache_max_size: usize,
    ) -> Result<Box<dyn CompiledModule>, WasmError>;
}
