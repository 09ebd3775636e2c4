//! # wrr-sched
//!
//! Cooperative round-robin scheduling of sandboxed WebAssembly calls on a
//! single host thread.
//!
//! Guest code never yields on its own. Instead a background
//! [`InterruptDriver`] advances a shared [`EpochClock`]; every execution
//! context carries an [`EpochDeadline`], and when a running guest reaches
//! its deadline it either suspends (so the next task gets a turn) or traps,
//! depending on its [`DeadlinePolicy`].
//!
//! | Piece | Role |
//! |-------|------|
//! | [`EpochClock`] | Monotonic tick counter shared by all contexts of a runtime |
//! | [`InterruptDriver`] | Background thread advancing the clock at a fixed period |
//! | [`EpochDeadline`] | Per-context deadline and yield/trap decision |
//! | [`Task`] | One resumable instantiation or invocation |
//! | [`RoundRobin`] | Polls tasks in insertion order until all have finished |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use wrr_sched::{RoundRobin, Runtime, RuntimeConfig};
//!
//! let runtime = Runtime::new(RuntimeConfig::default())?;
//! let artifact = runtime.compile_file("guest.wasm")?;
//! let resolver = runtime.resolver()?;
//! let interrupts = runtime.start_interrupts()?;
//!
//! let mut a = runtime.context()?;
//! let mut b = runtime.context()?;
//! let (ia, ib) = {
//!     let mut driver = RoundRobin::new();
//!     let ia = driver.spawn(a.instantiate(&artifact, &resolver));
//!     let ib = driver.spawn(b.instantiate(&artifact, &resolver));
//!     driver.run();
//!     (ia.try_take().unwrap()?, ib.try_take().unwrap()?)
//! };
//!
//! let mut driver = RoundRobin::new();
//! driver.spawn_with(a.invoke(&ia, "run", &[]), |r| println!("a: {:?}", r));
//! driver.spawn_with(b.invoke(&ib, "run", &[]), |r| println!("b: {:?}", r));
//! driver.run();
//! interrupts.stop();
//! ```
//!
//! ## Features
//!
//! - `wasm` (default) - wasmtime-backed artifacts, contexts and instances

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod deadline;
pub mod driver;
pub mod epoch;
pub mod error;
pub mod task;

#[cfg(feature = "wasm")]
pub mod wasm;

#[cfg(test)]
mod testing;

// Re-export main types
pub use deadline::{Checkpoint, DeadlinePolicy, EpochDeadline};
pub use driver::{Completion, DriverStats, RoundRobin, TaskReport};
pub use epoch::{EpochClock, EpochSink, InterruptDriver, InterruptHandle};
pub use error::{Result, SchedError};
pub use task::{ContextHealth, GuestCall, Task, TaskId, TaskState, TaskStats};

#[cfg(feature = "wasm")]
pub use wasm::{
    Artifact, ContextId, ExecutionContext, ImportResolver, Instance, Runtime, RuntimeConfig,
    WasiCapabilities,
};
