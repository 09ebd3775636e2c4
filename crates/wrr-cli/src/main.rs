//! wrr command-line interface
//!
//! This CLI provides tools for:
//! - Running WebAssembly guests round-robin on one thread, preempted by epoch interrupts
//! - Listing the functions a guest exports
//!
//! Guests may be binary `.wasm` or `.wat` text.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{info, warn};
use wrr_sched::wasm::{FuncType, Val, ValType};
use wrr_sched::{
    Artifact, DeadlinePolicy, ExecutionContext, Instance, RoundRobin, Runtime, RuntimeConfig,
    WasiCapabilities,
};

#[derive(Parser)]
#[command(name = "wrr")]
#[command(author, version, about = "Round-robin WebAssembly runner", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Instantiate and invoke guests round-robin under epoch interrupts
    Run {
        /// Guest modules (.wasm or .wat)
        #[arg(required = true)]
        modules: Vec<PathBuf>,

        /// Exported function to invoke in every instance
        #[arg(short, long, default_value = "_start")]
        entry: String,

        /// Arguments for the entry, parsed against its parameter types
        #[arg(short, long = "arg", allow_hyphen_values = true)]
        args: Vec<String>,

        /// Instances per module, each in its own context
        #[arg(short = 'n', long, default_value = "1")]
        copies: usize,

        /// JSON runtime config (flags below override it)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Milliseconds between epoch interrupts
        #[arg(long)]
        tick: Option<u64>,

        /// Epochs a guest may run before it must yield
        #[arg(long)]
        interval: Option<u64>,

        /// What happens when a guest reaches its deadline
        #[arg(long, value_enum)]
        policy: Option<PolicyArg>,

        /// Fuel granted to each context
        #[arg(long)]
        fuel: Option<u64>,

        /// Let guests use the host's stdio through WASI
        #[arg(long)]
        stdio: bool,

        /// Print scheduler statistics as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the functions a guest exports
    Exports {
        /// Guest module (.wasm or .wat)
        module: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum PolicyArg {
    /// Suspend the guest and let the next task run
    Yield,
    /// Abort the guest with a deadline trap
    Trap,
}

impl From<PolicyArg> for DeadlinePolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Yield => DeadlinePolicy::YieldAndReschedule,
            PolicyArg::Trap => DeadlinePolicy::TrapOnDeadline,
        }
    }
}

/// One scheduled guest copy.
struct Slot {
    ctx: ExecutionContext,
    artifact: usize,
    copy: usize,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Run {
            modules,
            entry,
            args,
            copies,
            config,
            tick,
            interval,
            policy,
            fuel,
            stdio,
            json,
        } => {
            let config = build_config(config, tick, interval, policy, fuel, stdio)?;
            cmd_run(modules, entry, args, copies, config, json)
        }

        Commands::Exports { module } => cmd_exports(module),
    }
}

fn build_config(
    path: Option<PathBuf>,
    tick: Option<u64>,
    interval: Option<u64>,
    policy: Option<PolicyArg>,
    fuel: Option<u64>,
    stdio: bool,
) -> Result<RuntimeConfig> {
    let mut config = match path {
        Some(path) => RuntimeConfig::from_json_file(&path)
            .with_context(|| format!("Failed to load config {:?}", path))?,
        None => RuntimeConfig::default(),
    };

    if let Some(ms) = tick {
        config = config.tick_interval_ms(ms);
    }
    if let Some(epochs) = interval {
        config = config.deadline_interval(epochs);
    }
    if let Some(policy) = policy {
        config = config.deadline_policy(policy.into());
    }
    if let Some(fuel) = fuel {
        config = config.fuel_limit(fuel);
    }
    if stdio {
        let caps = WasiCapabilities {
            stdout: true,
            stderr: true,
            ..config.capabilities.clone()
        };
        config = config.capabilities(caps);
    }

    config.validate()?;
    Ok(config)
}

fn cmd_run(
    modules: Vec<PathBuf>,
    entry: String,
    args: Vec<String>,
    copies: usize,
    config: RuntimeConfig,
    json: bool,
) -> Result<()> {
    if copies == 0 {
        bail!("--copies must be at least 1");
    }

    let runtime = Runtime::new(config)?;
    let resolver = runtime.resolver()?;

    let mut artifacts = Vec::with_capacity(modules.len());
    for path in &modules {
        let artifact = runtime
            .compile_file(path)
            .with_context(|| format!("Failed to load {:?}", path))?;
        info!("Loaded {} ({} exports)", artifact.name(), artifact.exports().count());
        artifacts.push(artifact);
    }

    // Arguments are typed per artifact; a missing entry is reported by the task.
    let mut call_args = Vec::with_capacity(artifacts.len());
    for artifact in &artifacts {
        let values = match artifact.signature(&entry) {
            Some(ty) => parse_args(&ty, &args)
                .with_context(|| format!("Bad arguments for {}::{}", artifact.name(), entry))?,
            None => Vec::new(),
        };
        call_args.push(values);
    }

    let mut slots = Vec::with_capacity(artifacts.len() * copies);
    for (index, _) in artifacts.iter().enumerate() {
        for copy in 0..copies {
            slots.push(Slot {
                ctx: runtime.context()?,
                artifact: index,
                copy,
            });
        }
    }

    let interrupts = runtime.start_interrupts()?;
    let start = Instant::now();

    let instances: Vec<Option<Instance>> = {
        let mut driver = RoundRobin::new();
        let pending: Vec<_> = slots
            .iter_mut()
            .map(|slot| driver.spawn(slot.ctx.instantiate(&artifacts[slot.artifact], &resolver)))
            .collect();
        driver.run();

        pending
            .iter()
            .map(|completion| match completion.try_take() {
                Some(Ok(instance)) => Some(instance),
                Some(Err(e)) => {
                    warn!("Instantiation failed: {}", e);
                    None
                }
                None => None,
            })
            .collect()
    };

    let (outcomes, stats) = {
        let mut driver = RoundRobin::new();
        let mut pending = Vec::new();
        for (slot, instance) in slots.iter_mut().zip(&instances) {
            let name = slot_name(&artifacts, slot.artifact, slot.copy);
            if let Some(instance) = instance {
                let task = slot.ctx.invoke(instance, &entry, &call_args[slot.artifact]);
                pending.push((name, Some(driver.spawn(task))));
            } else {
                pending.push((name, None));
            }
        }
        let stats = driver.run().clone();

        let outcomes: Vec<_> = pending
            .into_iter()
            .map(|(name, completion)| (name, completion.and_then(|c| c.try_take())))
            .collect();
        (outcomes, stats)
    };

    let elapsed = start.elapsed();
    let ticks = interrupts.stop();

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!("=== Round-Robin Run ===");
        println!();
        println!("Results:");
        for (name, outcome) in &outcomes {
            match outcome {
                Some(Ok(values)) => println!("  {:<24} ok [{}]", name, format_values(values)),
                Some(Err(e)) => println!("  {:<24} {}", name, e),
                None => println!("  {:<24} not instantiated", name),
            }
        }
        println!();
        println!("Scheduler:");
        println!("  Rounds:            {}", stats.rounds);
        println!("  Polls:             {}", stats.polls);
        println!("  Completed:         {}", stats.completed);
        println!("  Trapped:           {}", stats.trapped);
        println!("  Failed:            {}", stats.failed);
        println!("  Interrupts:        {}", ticks);
        println!("  Wall time:         {:.2?}", elapsed);
        println!();
        println!("Tasks:");
        for report in &stats.finished {
            println!(
                "  {} {:<32} round {:>4}  yields {:>5}  busy {:.2?}",
                report.id, report.label, report.finished_in_round, report.stats.yields, report.stats.busy
            );
        }
    }

    let unfinished = outcomes
        .iter()
        .filter(|(_, outcome)| !matches!(outcome, Some(Ok(_))))
        .count();
    if unfinished > 0 {
        bail!("{} of {} guest(s) did not complete", unfinished, outcomes.len());
    }
    Ok(())
}

fn cmd_exports(module: PathBuf) -> Result<()> {
    let runtime = Runtime::new(RuntimeConfig::default())?;
    let artifact = runtime
        .compile_file(&module)
        .with_context(|| format!("Failed to load {:?}", module))?;

    println!("=== Exports of {} ===", artifact.name());
    println!();
    for name in artifact.exports() {
        if let Some(ty) = artifact.signature(name) {
            println!("  {}", format_signature(name, &ty));
        }
    }
    Ok(())
}

fn slot_name(artifacts: &[Artifact], index: usize, copy: usize) -> String {
    format!("{}#{}", artifacts[index].name(), copy)
}

/// Parse textual arguments against the parameter types of `ty`.
fn parse_args(ty: &FuncType, args: &[String]) -> Result<Vec<Val>> {
    let params: Vec<ValType> = ty.params().collect();
    if params.len() != args.len() {
        bail!("expected {} argument(s), got {}", params.len(), args.len());
    }

    params
        .iter()
        .zip(args)
        .map(|(param, text)| parse_val(param, text))
        .collect()
}

fn parse_val(ty: &ValType, text: &str) -> Result<Val> {
    let val = match ty {
        ValType::I32 => Val::I32(
            text.parse::<i32>()
                .or_else(|_| text.parse::<u32>().map(|v| v as i32))
                .with_context(|| format!("'{}' is not an i32", text))?,
        ),
        ValType::I64 => Val::I64(
            text.parse::<i64>()
                .or_else(|_| text.parse::<u64>().map(|v| v as i64))
                .with_context(|| format!("'{}' is not an i64", text))?,
        ),
        ValType::F32 => Val::F32(
            text.parse::<f32>()
                .with_context(|| format!("'{}' is not an f32", text))?
                .to_bits(),
        ),
        ValType::F64 => Val::F64(
            text.parse::<f64>()
                .with_context(|| format!("'{}' is not an f64", text))?
                .to_bits(),
        ),
        other => bail!("cannot pass {} arguments from the command line", other),
    };
    Ok(val)
}

fn format_values(values: &[Val]) -> String {
    values
        .iter()
        .map(|v| match v {
            Val::I32(x) => x.to_string(),
            Val::I64(x) => x.to_string(),
            Val::F32(bits) => f32::from_bits(*bits).to_string(),
            Val::F64(bits) => f64::from_bits(*bits).to_string(),
            other => format!("{:?}", other),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_signature(name: &str, ty: &FuncType) -> String {
    let params: Vec<String> = ty.params().map(|p| p.to_string()).collect();
    let results: Vec<String> = ty.results().map(|r| r.to_string()).collect();
    if results.is_empty() {
        format!("{}({})", name, params.join(", "))
    } else {
        format!("{}({}) -> {}", name, params.join(", "), results.join(", "))
    }
}
