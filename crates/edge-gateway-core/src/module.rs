//! Compiled guest modules.
//!
//! A [`CompiledModule`] is the executable form of one deploy artifact. It is
//! produced exactly once per deploy by the module cache and then shared by
//! every concurrent invocation of that deploy.
//!
//! # Kinds
//!
//! - **Command**: a WASI command module whose `_start` runs the function
//!   (`go` deploys)
//! - **Script**: source text run by the shared JavaScript interpreter module
//!   (`js` deploys)

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;

use tracing::{info, instrument};
use wasmtime::{Engine, Module};

use edge_gateway_common::{DeployId, GatewayError};

use crate::sandbox::GuestModule;

/// The compiled, reusable form of one deploy.
///
/// # Thread Safety
///
/// `CompiledModule` is thread-safe. The underlying Wasmtime module holds only
/// immutable machine code; each invocation instantiates it into its own store.
#[derive(Clone)]
pub struct CompiledModule {
    deploy_id: DeployId,

    inner: ModuleKind,

    /// 64-bit hash of the original artifact bytes.
    content_hash: String,

    compiled_at: Instant,
}

#[derive(Clone)]
enum ModuleKind {
    /// A WASI command module.
    Command(Module),
    /// A script plus the interpreter that evaluates it.
    Script { interpreter: Module, source: Arc<str> },
}

impl CompiledModule {
    /// Compile a WASI command module from WebAssembly bytes.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::CompileFailed`] if the bytes are not a valid
    /// WebAssembly module.
    #[instrument(skip(engine, bytes), fields(deploy_id = %deploy_id, bytes_len = bytes.len()))]
    pub fn from_bytes(
        engine: &Engine,
        deploy_id: DeployId,
        bytes: &[u8],
    ) -> Result<Self, GatewayError> {
        let start = Instant::now();

        Self::validate_wasm_header(bytes)?;

        let module = Module::new(engine, bytes).map_err(|e| {
            GatewayError::compile_failed(format!("Module compilation failed: {e}"))
        })?;

        let content_hash = compute_hash(bytes);

        info!(
            content_hash = %content_hash,
            duration_ms = start.elapsed().as_millis(),
            "Command module compiled"
        );

        Ok(Self {
            deploy_id,
            inner: ModuleKind::Command(module),
            content_hash,
            compiled_at: Instant::now(),
        })
    }

    /// Compile a command module from WAT (WebAssembly Text Format).
    ///
    /// This is primarily for testing purposes.
    ///
    /// # Errors
    ///
    /// Returns an error if the text does not assemble or compile.
    #[instrument(skip(engine, wat), fields(deploy_id = %deploy_id))]
    pub fn from_wat(engine: &Engine, deploy_id: DeployId, wat: &str) -> Result<Self, GatewayError> {
        let module = Module::new(engine, wat)
            .map_err(|e| GatewayError::compile_failed(format!("WAT compilation failed: {e}")))?;

        Ok(Self {
            deploy_id,
            inner: ModuleKind::Command(module),
            content_hash: compute_hash(wat.as_bytes()),
            compiled_at: Instant::now(),
        })
    }

    /// Bind script source to an already compiled interpreter.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::CompileFailed`] if the source is not UTF-8 or
    /// is empty.
    pub fn script(
        interpreter: Module,
        deploy_id: DeployId,
        source: &[u8],
    ) -> Result<Self, GatewayError> {
        let text = std::str::from_utf8(source)
            .map_err(|e| GatewayError::compile_failed(format!("Script is not UTF-8: {e}")))?;
        if text.trim().is_empty() {
            return Err(GatewayError::compile_failed("Script is empty"));
        }

        Ok(Self {
            deploy_id,
            inner: ModuleKind::Script {
                interpreter,
                source: Arc::from(text),
            },
            content_hash: compute_hash(source),
            compiled_at: Instant::now(),
        })
    }

    /// The Wasmtime module to instantiate for this deploy.
    pub fn wasm_module(&self) -> &Module {
        match &self.inner {
            ModuleKind::Command(module) => module,
            ModuleKind::Script { interpreter, .. } => interpreter,
        }
    }

    /// Script source, for interpreter-backed deploys.
    pub fn script_source(&self) -> Option<&str> {
        match &self.inner {
            ModuleKind::Command(_) => None,
            ModuleKind::Script { source, .. } => Some(source),
        }
    }

    /// Get the content hash of the original artifact bytes.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// Get when this module was compiled.
    pub fn compiled_at(&self) -> Instant {
        self.compiled_at
    }

    /// Check if this deploy runs through the script interpreter.
    pub fn is_script(&self) -> bool {
        matches!(self.inner, ModuleKind::Script { .. })
    }

    /// Validate WebAssembly header (magic number and version).
    fn validate_wasm_header(bytes: &[u8]) -> Result<(), GatewayError> {
        if bytes.len() < 8 {
            return Err(GatewayError::compile_failed("Invalid Wasm: file too small"));
        }

        if &bytes[0..4] != b"\0asm" {
            return Err(GatewayError::compile_failed(
                "Invalid Wasm: bad magic number",
            ));
        }

        Ok(())
    }
}

impl GuestModule for CompiledModule {
    fn deploy_id(&self) -> &DeployId {
        &self.deploy_id
    }
}

impl std::fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledModule")
            .field("deploy_id", &self.deploy_id)
            .field("content_hash", &self.content_hash)
            .field("is_script", &self.is_script())
            .finish_non_exhaustive()
    }
}

fn compute_hash(bytes: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
