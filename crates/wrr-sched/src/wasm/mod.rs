//! wasmtime as the sandbox behind the scheduler.
//!
//! This module supplies the three operations the scheduler needs from a
//! sandbox and wires the epoch checkpoint into it:
//!
//! - [`Runtime::compile`]: binary wasm or WAT text to an immutable [`Artifact`]
//! - [`ExecutionContext::instantiate`]: artifact to an [`Instance`], as a task
//! - [`ExecutionContext::invoke`]: call an export, as a task
//!
//! ## Usage
//!
//! ```rust,ignore
//! use wrr_sched::wasm::{Runtime, RuntimeConfig};
//! use wrr_sched::RoundRobin;
//!
//! let runtime = Runtime::new(RuntimeConfig::default())?;
//! let artifact = runtime.compile_file("guest.wat")?;
//! let resolver = runtime.resolver()?;
//! let mut ctx = runtime.context()?;
//!
//! let mut driver = RoundRobin::new();
//! let slot = driver.spawn(ctx.instantiate(&artifact, &resolver));
//! driver.run();
//! ```
//!
//! ## Threading
//!
//! The engine, artifacts and the clock may be shared across threads.
//! Contexts and the tasks borrowing them stay on the driver thread.

mod config;
mod imports;
mod runtime;

pub use config::{RuntimeConfig, WasiCapabilities};
pub use imports::{ImportResolver, HOST_MODULE};
pub use runtime::{Artifact, ContextId, ExecutionContext, HostState, Instance, Runtime};

pub use wasmtime::{FuncType, Val, ValType};
