//! Module loading and the execution seam.
//!
//! The ABI of the evaluator stays behind [`WasmRuntime`]: the core hands a
//! module binary, a memory buffer, and one message across the seam and gets
//! back the next memory plus an outbox. Binaries are fetched and cached by
//! [`ModuleLoader`]; compilation happens inside workers, which keep their
//! own compiled-artifact caches.

mod evaluator;
mod loader;

pub use evaluator::{CompiledModule, EvalOutcome, EvalRequest, WasmRuntime};
pub use loader::ModuleLoader;

use crate::config::CuConfig;
use crate::model::ModuleMeta;

#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum WasmError {
    #[error("module binary I/O failed: {0}")]
    #[diagnostic(code(cueval::wasm::io))]
    Io(#[from] std::io::Error),

    #[error("module fetch failed: {0}")]
    #[diagnostic(
        code(cueval::wasm::fetch),
        help("Transient network failure fetching the module binary; retry the read.")
    )]
    Fetch(#[from] reqwest::Error),

    #[error("module {module_id} rejected: {reason}")]
    #[diagnostic(
        code(cueval::wasm::inadmissible),
        help("The module violates this CU's admissibility limits; this is terminal.")
    )]
    Inadmissible { module_id: String, reason: String },

    #[error("module {module_id} failed to compile: {reason}")]
    #[diagnostic(code(cueval::wasm::compile))]
    Compile { module_id: String, reason: String },
}

/// Limits a module's metadata must satisfy before this CU will run it.
#[derive(Debug, Clone)]
pub struct ModulePolicy {
    pub supported_formats: Vec<String>,
    pub supported_extensions: Vec<String>,
    pub memory_max_limit: u64,
    pub compute_max_limit: u64,
}

impl ModulePolicy {
    pub fn from_config(cfg: &CuConfig) -> Self {
        Self {
            supported_formats: cfg.wasm_supported_formats.clone(),
            supported_extensions: cfg.wasm_supported_extensions.clone(),
            memory_max_limit: cfg.wasm_memory_max_limit,
            compute_max_limit: cfg.wasm_compute_max_limit,
        }
    }

    /// Reject modules this CU cannot or will not run. Terminal on failure.
    pub fn check(&self, module: &ModuleMeta) -> Result<(), WasmError> {
        let fail = |reason: String| WasmError::Inadmissible {
            module_id: module.id.clone(),
            reason,
        };
        if !self
            .supported_formats
            .iter()
            .any(|f| f == module.format.as_str())
        {
            return Err(fail(format!("unsupported format {}", module.format.as_str())));
        }
        if let Some(ext) = module
            .options
            .extensions
            .iter()
            .find(|e| !self.supported_extensions.contains(e))
        {
            return Err(fail(format!("unsupported extension {ext}")));
        }
        if module.options.memory_limit > self.memory_max_limit {
            return Err(fail(format!(
                "memory limit {} exceeds maximum {}",
                module.options.memory_limit, self.memory_max_limit
            )));
        }
        if module.options.compute_limit > self.compute_max_limit {
            return Err(fail(format!(
                "compute limit {} exceeds maximum {}",
                module.options.compute_limit, self.compute_max_limit
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModuleFormat, ModuleOptions};

    fn module(format: &str, memory: u64, compute: u64, extensions: Vec<String>) -> ModuleMeta {
        ModuleMeta {
            id: "mod-1".into(),
            owner: "owner".into(),
            tags: vec![],
            format: ModuleFormat(format.into()),
            options: ModuleOptions {
                memory_limit: memory,
                compute_limit: compute,
                extensions,
            },
        }
    }

    fn policy() -> ModulePolicy {
        ModulePolicy {
            supported_formats: vec!["wasm32-unknown-emscripten".into()],
            supported_extensions: vec!["weave-drive".into()],
            memory_max_limit: 1024,
            compute_max_limit: 1000,
        }
    }

    #[test]
    fn admissible_module_passes() {
        let m = module(
            "wasm32-unknown-emscripten",
            512,
            900,
            vec!["weave-drive".into()],
        );
        assert!(policy().check(&m).is_ok());
    }

    #[test]
    fn violations_are_terminal() {
        assert!(policy().check(&module("wasm64-other", 1, 1, vec![])).is_err());
        assert!(
            policy()
                .check(&module("wasm32-unknown-emscripten", 4096, 1, vec![]))
                .is_err()
        );
        assert!(
            policy()
                .check(&module(
                    "wasm32-unknown-emscripten",
                    1,
                    1,
                    vec!["unknown-ext".into()]
                ))
                .is_err()
        );
    }
}
