//! wasmtime-backed artifacts, execution contexts and instances.
//!
//! The engine runs with async support and epoch interruption enabled. Every
//! store installs an epoch-deadline callback that forwards to the context's
//! [`EpochDeadline::checkpoint`]; a `MustYield` becomes
//! `UpdateDeadline::Yield`, which makes the pending call future return
//! `Pending` at the next safe point. The store's own deadline is always one
//! engine tick ahead, so the callback runs once per clock advance and the
//! decision is made against the context's deadline, not the engine's.

use super::config::{RuntimeConfig, WasiCapabilities};
use super::imports::ImportResolver;
use crate::deadline::{Checkpoint, DeadlinePolicy, EpochDeadline};
use crate::epoch::{EpochClock, EpochSink, InterruptDriver, InterruptHandle};
use crate::error::{Result, SchedError};
use crate::task::{ContextHealth, Task};

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use wasmtime::{
    Config, Engine, ExternType, FuncType, Module, OptLevel, Store, StoreLimits, StoreLimitsBuilder,
    Trap, UpdateDeadline, Val,
};
use wasmtime_wasi::preview1::WasiP1Ctx;
use wasmtime_wasi::I32Exit;

impl EpochSink for Engine {
    fn on_advance(&self, _epoch: u64) {
        self.increment_epoch();
    }
}

/// Host state stored in every context's wasmtime store.
pub struct HostState {
    wasi: WasiP1Ctx,
    limits: StoreLimits,
    deadline: EpochDeadline,
}

impl HostState {
    /// Deadline state of the owning context.
    pub fn deadline(&self) -> &EpochDeadline {
        &self.deadline
    }

    pub(crate) fn wasi_mut(&mut self) -> &mut WasiP1Ctx {
        &mut self.wasi
    }
}

/// Engine-level owner of the epoch clock; factory for everything else.
///
/// Each runtime has its own clock, so interrupts sent to one runtime never
/// reach contexts created by another.
pub struct Runtime {
    engine: Engine,
    clock: EpochClock,
    config: RuntimeConfig,
    next_context: AtomicU64,
}

impl Runtime {
    /// Create a runtime with the given configuration.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        config.validate()?;

        let mut engine_config = Config::new();
        engine_config.async_support(true);
        engine_config.epoch_interruption(true);

        engine_config.cranelift_opt_level(match config.optimization_level {
            0 => OptLevel::None,
            1 => OptLevel::Speed,
            _ => OptLevel::SpeedAndSize,
        });

        // Relaxed SIMD builds on SIMD and has to follow it.
        engine_config.wasm_simd(config.enable_simd);
        engine_config.wasm_relaxed_simd(config.enable_simd);

        if config.fuel_limit.is_some() {
            engine_config.consume_fuel(true);
        }

        let engine = Engine::new(&engine_config)
            .map_err(|e| SchedError::Config(format!("engine creation failed: {}", e)))?;
        let clock = EpochClock::with_sink(engine.clone());

        Ok(Self {
            engine,
            clock,
            config,
            next_context: AtomicU64::new(1),
        })
    }

    /// The runtime's epoch clock.
    pub fn clock(&self) -> &EpochClock {
        &self.clock
    }

    /// Get the configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// An interrupt driver firing at the configured tick interval.
    pub fn interrupt_driver(&self) -> InterruptDriver {
        InterruptDriver::new(Duration::from_millis(self.config.tick_interval_ms))
    }

    /// Start advancing this runtime's clock in the background.
    pub fn start_interrupts(&self) -> Result<InterruptHandle> {
        self.interrupt_driver().spawn(self.clock.clone())
    }

    /// Compile a guest program from binary wasm or WAT text.
    pub fn compile(&self, name: &str, source: &[u8]) -> Result<Artifact> {
        let module = Module::new(&self.engine, source)
            .map_err(|e| SchedError::Compile(format!("{}: {:#}", name, e)))?;
        tracing::debug!(artifact = name, bytes = source.len(), "compiled");
        Ok(Artifact {
            module,
            name: name.to_string(),
        })
    }

    /// Compile a guest program from a file; the artifact is named after the file stem.
    pub fn compile_file(&self, path: impl AsRef<Path>) -> Result<Artifact> {
        let path = path.as_ref();
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown")
            .to_string();
        let source = std::fs::read(path)?;
        self.compile(&name, &source)
    }

    /// Create an import resolver with WASI (if configured) and the `wrr` host imports.
    pub fn resolver(&self) -> Result<ImportResolver> {
        ImportResolver::new(&self.engine, self.config.link_wasi)
    }

    /// Create a context using the configured deadline interval and policy.
    pub fn context(&self) -> Result<ExecutionContext> {
        self.context_with(self.config.deadline_interval, self.config.deadline_policy)
    }

    /// Create a context with its own deadline interval and policy.
    pub fn context_with(&self, interval: u64, policy: DeadlinePolicy) -> Result<ExecutionContext> {
        let id = ContextId(self.next_context.fetch_add(1, Ordering::Relaxed));
        let deadline = EpochDeadline::new(self.clock.clone(), interval, policy)?;
        let wasi = build_wasi(&self.config.capabilities)?;

        let mut limits = StoreLimitsBuilder::new();
        if self.config.max_memory > 0 {
            limits = limits.memory_size(self.config.max_memory);
        }

        let mut store = Store::new(
            &self.engine,
            HostState {
                wasi,
                limits: limits.build(),
                deadline,
            },
        );
        store.limiter(|state| &mut state.limits);

        if let Some(fuel) = self.config.fuel_limit {
            store
                .set_fuel(fuel)
                .map_err(|e| SchedError::Config(format!("fuel setup failed: {}", e)))?;
        }

        store.set_epoch_deadline(1);
        store.epoch_deadline_callback(|mut cx| {
            match cx.data_mut().deadline.checkpoint()? {
                Checkpoint::Continue => Ok(UpdateDeadline::Continue(1)),
                Checkpoint::MustYield => Ok(UpdateDeadline::Yield(1)),
            }
        });

        tracing::debug!(context = %id, interval, ?policy, "context created");

        Ok(ExecutionContext {
            id,
            store,
            health: ContextHealth::new(),
        })
    }
}

/// Build the WASI context from capabilities.
fn build_wasi(caps: &WasiCapabilities) -> Result<WasiP1Ctx> {
    let mut builder = wasmtime_wasi::WasiCtxBuilder::new();

    if caps.stdin {
        builder.inherit_stdin();
    }
    if caps.stdout {
        builder.inherit_stdout();
    }
    if caps.stderr {
        builder.inherit_stderr();
    }

    if caps.inherit_env {
        builder.inherit_env();
    }
    for (key, value) in &caps.env_vars {
        builder.env(key, value);
    }

    builder.args(&caps.args);

    for dir in &caps.preopened_dirs_ro {
        builder
            .preopened_dir(
                dir,
                dir.to_string_lossy(),
                wasmtime_wasi::DirPerms::READ,
                wasmtime_wasi::FilePerms::READ,
            )
            .map_err(|e| SchedError::Config(format!("failed to open dir {:?}: {}", dir, e)))?;
    }

    for dir in &caps.preopened_dirs_rw {
        builder
            .preopened_dir(
                dir,
                dir.to_string_lossy(),
                wasmtime_wasi::DirPerms::all(),
                wasmtime_wasi::FilePerms::all(),
            )
            .map_err(|e| SchedError::Config(format!("failed to open dir {:?}: {}", dir, e)))?;
    }

    Ok(builder.build_p1())
}

/// Give a task a fresh deadline as it starts running.
fn rearm(store: &mut Store<HostState>) {
    store.data_mut().deadline.rearm();
    store.set_epoch_deadline(1);
}

/// Map a wasmtime error onto the scheduler taxonomy.
fn classify(err: anyhow::Error) -> SchedError {
    if let Some(SchedError::DeadlineExceeded { deadline, epoch }) = err.downcast_ref::<SchedError>() {
        return SchedError::DeadlineExceeded {
            deadline: *deadline,
            epoch: *epoch,
        };
    }
    if let Some(exit) = err.downcast_ref::<I32Exit>() {
        return SchedError::Trap(format!("guest exited with status {}", exit.0));
    }
    if err.downcast_ref::<Trap>().is_some() {
        return SchedError::Trap(format!("{:#}", err));
    }
    SchedError::Host(format!("{:#}", err))
}

/// A compiled, immutable guest program. Cloning shares the compiled code.
#[derive(Clone)]
pub struct Artifact {
    module: Module,
    name: String,
}

impl Artifact {
    /// Get the artifact name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get exported function names.
    pub fn exports(&self) -> impl Iterator<Item = &str> {
        self.module.exports().filter_map(|e| {
            if matches!(e.ty(), ExternType::Func(_)) {
                Some(e.name())
            } else {
                None
            }
        })
    }

    /// Signature of an exported function.
    pub fn signature(&self, entry: &str) -> Option<FuncType> {
        match self.module.get_export(entry) {
            Some(ExternType::Func(ty)) => Some(ty),
            _ => None,
        }
    }

    pub(crate) fn module(&self) -> &Module {
        &self.module
    }
}

impl fmt::Debug for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Artifact")
            .field("name", &self.name)
            .field("exports", &self.exports().collect::<Vec<_>>())
            .finish()
    }
}

/// Identifier of an execution context within its runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// An artifact bound into one execution context.
#[derive(Debug, Clone)]
pub struct Instance {
    handle: wasmtime::Instance,
    context: ContextId,
    artifact: String,
    exports: Vec<String>,
}

impl Instance {
    /// Context the instance lives in.
    pub fn context(&self) -> ContextId {
        self.context
    }

    /// Name of the artifact it was created from.
    pub fn artifact(&self) -> &str {
        &self.artifact
    }

    /// Exported function names.
    pub fn exports(&self) -> &[String] {
        &self.exports
    }

    /// True if `entry` is an exported function.
    pub fn has_export(&self, entry: &str) -> bool {
        self.exports.iter().any(|e| e == entry)
    }
}

/// Per-instance execution state: the wasmtime store, its deadline and health.
///
/// Instantiation and invocation borrow the context mutably for the lifetime
/// of the returned [`Task`], so a context never runs two tasks at once and
/// cannot be reused until a cancelled task has been dropped.
pub struct ExecutionContext {
    id: ContextId,
    store: Store<HostState>,
    health: ContextHealth,
}

impl ExecutionContext {
    /// Context identifier.
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Instantiate `artifact` as a resumable task.
    ///
    /// Imports are resolved before the task is built: a missing import gives a
    /// task that fails with [`SchedError::Link`] without running guest code.
    /// A start function that calls WASI `proc_exit(0)` fails the task with
    /// [`SchedError::Host`] and leaves the context usable.
    pub fn instantiate(&mut self, artifact: &Artifact, resolver: &ImportResolver) -> Task<'_, Instance> {
        let label = format!("instantiate {} in {}", artifact.name(), self.id);
        if let Err(e) = self.ready() {
            return Task::rejected(label, e);
        }
        if !Engine::same(self.store.engine(), artifact.module().engine())
            || !Engine::same(self.store.engine(), resolver.engine())
        {
            return Task::rejected(
                label,
                SchedError::host("artifact, resolver and context come from different runtimes"),
            );
        }
        let pre = match resolver.linker().instantiate_pre(artifact.module()) {
            Ok(pre) => pre,
            Err(e) => {
                return Task::rejected(label, SchedError::Link(format!("{}: {:#}", artifact.name(), e)));
            }
        };

        let context = self.id;
        let artifact_name = artifact.name().to_string();
        let exports = artifact.exports().map(str::to_string).collect();
        let health = self.health.clone();
        let store = &mut self.store;

        Task::new(
            label,
            Box::pin(async move {
                rearm(store);
                let handle = match pre.instantiate_async(&mut *store).await {
                    Ok(handle) => handle,
                    Err(e) => match e.downcast_ref::<I32Exit>() {
                        // A start function that exits cleanly leaves no instance behind.
                        Some(I32Exit(0)) => {
                            return Err(SchedError::host(format!(
                                "{} exited with status 0 during instantiation",
                                artifact_name
                            )));
                        }
                        _ => return Err(classify(e)),
                    },
                };
                Ok(Instance {
                    handle,
                    context,
                    artifact: artifact_name,
                    exports,
                })
            }),
        )
        .watch(health)
    }

    /// Call the exported function `entry` of `instance` as a resumable task.
    ///
    /// Host-side problems (poisoned context, foreign instance, unknown entry,
    /// wrong argument count) give a task that fails on its first poll without
    /// executing guest code. A WASI `proc_exit(0)` counts as a normal return
    /// with no results.
    pub fn invoke(&mut self, instance: &Instance, entry: &str, args: &[Val]) -> Task<'_, Vec<Val>> {
        let label = format!("{}::{} in {}", instance.artifact(), entry, self.id);
        if let Err(e) = self.ready() {
            return Task::rejected(label, e);
        }
        if instance.context != self.id {
            return Task::rejected(
                label,
                SchedError::host(format!("instance belongs to {}, not {}", instance.context, self.id)),
            );
        }
        let Some(func) = instance.handle.get_func(&mut self.store, entry) else {
            return Task::rejected(
                label,
                SchedError::host(format!("{} has no exported function '{}'", instance.artifact(), entry)),
            );
        };
        let ty = func.ty(&self.store);
        if ty.params().len() != args.len() {
            return Task::rejected(
                label,
                SchedError::host(format!(
                    "'{}' takes {} argument(s), {} given",
                    entry,
                    ty.params().len(),
                    args.len()
                )),
            );
        }

        let mut results = vec![Val::I32(0); ty.results().len()];
        let args = args.to_vec();
        let health = self.health.clone();
        let store = &mut self.store;

        Task::new(
            label,
            Box::pin(async move {
                rearm(store);
                match func.call_async(&mut *store, &args, &mut results).await {
                    Ok(()) => Ok(results),
                    Err(e) => match e.downcast_ref::<I32Exit>() {
                        Some(I32Exit(0)) => Ok(Vec::new()),
                        _ => Err(classify(e)),
                    },
                }
            }),
        )
        .watch(health)
    }

    /// Refuse work on a poisoned context.
    fn ready(&self) -> Result<()> {
        match self.health.reason() {
            Some(reason) => Err(SchedError::host(format!(
                "{} is poisoned by an earlier trap: {}",
                self.id, reason
            ))),
            None => Ok(()),
        }
    }

    /// Current deadline (an epoch value).
    pub fn deadline(&self) -> u64 {
        self.store.data().deadline.deadline()
    }

    /// Epochs granted between yields.
    pub fn interval(&self) -> u64 {
        self.store.data().deadline.interval()
    }

    /// Active deadline policy.
    pub fn policy(&self) -> DeadlinePolicy {
        self.store.data().deadline.policy()
    }

    /// Change the deadline interval for later tasks.
    pub fn set_deadline_interval(&mut self, interval: u64) -> Result<()> {
        self.store.data_mut().deadline.set_interval(interval)
    }

    /// Change the deadline policy for later tasks.
    pub fn set_policy(&mut self, policy: DeadlinePolicy) {
        self.store.data_mut().deadline.set_policy(policy);
    }

    /// Checkpoints evaluated so far.
    pub fn checkpoints(&self) -> u64 {
        self.store.data().deadline.checks()
    }

    /// Checkpoints that made the guest yield.
    pub fn yields(&self) -> u64 {
        self.store.data().deadline.yields()
    }

    /// True once a trap has made this context unusable.
    pub fn is_poisoned(&self) -> bool {
        self.health.is_poisoned()
    }

    /// Reason the context was poisoned.
    pub fn poison_reason(&self) -> Option<&str> {
        self.health.reason()
    }

    /// Get remaining fuel (if fuel metering enabled).
    pub fn remaining_fuel(&self) -> Option<u64> {
        self.store.get_fuel().ok()
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.id)
            .field("deadline", &self.deadline())
            .field("interval", &self.interval())
            .field("policy", &self.policy())
            .field("poisoned", &self.health.reason())
            .finish()
    }
}
