//! Import resolution for guest modules.
//!
//! An [`ImportResolver`] wraps a wasmtime linker. It always carries the
//! `wrr` host namespace and, when configured, WASI preview1:
//!
//! ```wat
//! (import "wrr" "epoch" (func $epoch (result i64)))
//! (import "wrr" "deadline" (func $deadline (result i64)))
//! ```
//!
//! Host code may add its own functions with [`ImportResolver::func_wrap`].

use super::runtime::{Artifact, HostState};
use crate::error::{Result, SchedError};

use wasmtime::{Caller, Engine, IntoFunc, Linker};

/// Namespace of the built-in host imports.
pub const HOST_MODULE: &str = "wrr";

/// Resolves guest imports against host functions.
pub struct ImportResolver {
    linker: Linker<HostState>,
}

impl ImportResolver {
    pub(crate) fn new(engine: &Engine, link_wasi: bool) -> Result<Self> {
        let mut linker: Linker<HostState> = Linker::new(engine);

        if link_wasi {
            wasmtime_wasi::preview1::add_to_linker_async(&mut linker, |state| state.wasi_mut())
                .map_err(|e| SchedError::Link(format!("WASI link failed: {}", e)))?;
        }

        register_host_imports(&mut linker)?;

        Ok(Self { linker })
    }

    /// Define a host function the guest can import as `module::name`.
    pub fn func_wrap<Params, Args>(
        &mut self,
        module: &str,
        name: &str,
        func: impl IntoFunc<HostState, Params, Args>,
    ) -> Result<&mut Self> {
        self.linker
            .func_wrap(module, name, func)
            .map_err(|e| SchedError::Link(format!("failed to define {}::{}: {}", module, name, e)))?;
        Ok(self)
    }

    /// Resolve every import of `artifact` that is still missing to a function
    /// that traps when called.
    pub fn stub_missing_imports(&mut self, artifact: &Artifact) -> Result<&mut Self> {
        self.linker
            .define_unknown_imports_as_traps(artifact.module())
            .map_err(|e| SchedError::Link(format!("{}: {}", artifact.name(), e)))?;
        Ok(self)
    }

    pub(crate) fn linker(&self) -> &Linker<HostState> {
        &self.linker
    }

    pub(crate) fn engine(&self) -> &Engine {
        self.linker.engine()
    }
}

/// Register the `wrr` host namespace.
fn register_host_imports(linker: &mut Linker<HostState>) -> Result<()> {
    linker
        .func_wrap(HOST_MODULE, "epoch", |caller: Caller<'_, HostState>| -> i64 {
            caller.data().deadline().clock().read() as i64
        })
        .map_err(|e| SchedError::Link(format!("failed to register epoch: {}", e)))?;

    linker
        .func_wrap(HOST_MODULE, "deadline", |caller: Caller<'_, HostState>| -> i64 {
            caller.data().deadline().deadline() as i64
        })
        .map_err(|e| SchedError::Link(format!("failed to register deadline: {}", e)))?;

    Ok(())
}
