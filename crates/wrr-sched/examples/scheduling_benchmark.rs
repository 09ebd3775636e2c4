//! Scheduling overhead benchmarks
//!
//! Run with: cargo run -p wrr-sched --example scheduling_benchmark --release

use std::task::Poll;
use std::time::Instant;

use wrr_sched::wasm::Val;
use wrr_sched::{DeadlinePolicy, RoundRobin, Runtime, RuntimeConfig};

const SPIN_WAT: &str = r#"
(module
  (func (export "spin") (param $n i32) (result i32)
    (local $i i32)
    (block $done
      (loop $again
        local.get $i
        local.get $n
        i32.ge_u
        br_if $done
        local.get $i
        i32.const 1
        i32.add
        local.set $i
        br $again))
    local.get $i))
"#;

const TICK_LOOP_WAT: &str = r#"
(module
  (import "bench" "tick" (func $tick))
  (func (export "forever")
    (loop $again
      call $tick
      br $again)))
"#;

fn main() {
    println!("=== Round-Robin Scheduling Benchmarks ===\n");

    bench_instantiation();
    bench_invoke_without_interrupts();
    bench_yield_cost();
    bench_interleaving();

    println!("\n=== Benchmark Complete ===");
}

fn bench_instantiation() {
    println!("## Instantiation");

    let runtime = Runtime::new(RuntimeConfig::default()).unwrap();
    let artifact = runtime.compile("spin", SPIN_WAT.as_bytes()).unwrap();
    let resolver = runtime.resolver().unwrap();

    let mut times = Vec::new();
    for _ in 0..100 {
        let start = Instant::now();
        let mut ctx = runtime.context().unwrap();
        let mut task = ctx.instantiate(&artifact, &resolver);
        while task.poll().is_pending() {}
        times.push(start.elapsed().as_micros() as u64);
    }

    print_stats("context + instantiate", &times);
    println!();
}

fn bench_invoke_without_interrupts() {
    println!("## Invoke (clock idle)");

    let runtime = Runtime::new(RuntimeConfig::default()).unwrap();
    let artifact = runtime.compile("spin", SPIN_WAT.as_bytes()).unwrap();
    let resolver = runtime.resolver().unwrap();
    let mut ctx = runtime.context().unwrap();
    let instance = {
        let mut task = ctx.instantiate(&artifact, &resolver);
        loop {
            if let Poll::Ready(result) = task.poll() {
                break result.unwrap();
            }
        }
    };

    let mut times = Vec::new();
    for _ in 0..10_000 {
        let start = Instant::now();
        let mut task = ctx.invoke(&instance, "spin", &[Val::I32(1)]);
        while task.poll().is_pending() {}
        times.push(start.elapsed().as_micros() as u64);
    }

    print_stats("spin(1)", &times);
    println!();
}

fn bench_yield_cost() {
    println!("## Forced Yields");

    let runtime = Runtime::new(RuntimeConfig::default()).unwrap();
    let artifact = runtime.compile("ticker", TICK_LOOP_WAT.as_bytes()).unwrap();
    let mut resolver = runtime.resolver().unwrap();
    let clock = runtime.clock().clone();
    resolver
        .func_wrap("bench", "tick", move || {
            clock.advance();
        })
        .unwrap();
    let mut ctx = runtime.context_with(1, DeadlinePolicy::YieldAndReschedule).unwrap();
    let instance = {
        let mut task = ctx.instantiate(&artifact, &resolver);
        loop {
            if let Poll::Ready(result) = task.poll() {
                break result.unwrap();
            }
        }
    };

    // The guest advances the clock once per iteration, so every poll yields once.
    let mut times = Vec::new();
    let mut task = ctx.invoke(&instance, "forever", &[]);
    for _ in 0..10_000 {
        let start = Instant::now();
        let _ = task.poll();
        times.push(start.elapsed().as_micros() as u64);
    }
    println!("  yields recorded: {}", task.stats().yields);
    drop(task);

    print_stats("resume until next yield", &times);
    println!();
}

fn bench_interleaving() {
    println!("## Interleaving");

    for contexts in [1usize, 2, 4, 8] {
        let runtime = Runtime::new(RuntimeConfig::default().tick_interval_ms(1)).unwrap();
        let artifact = runtime.compile("spin", SPIN_WAT.as_bytes()).unwrap();
        let resolver = runtime.resolver().unwrap();
        let mut ctxs: Vec<_> = (0..contexts).map(|_| runtime.context().unwrap()).collect();

        let instances: Vec<_> = {
            let mut driver = RoundRobin::new();
            let pending: Vec<_> = ctxs
                .iter_mut()
                .map(|ctx| driver.spawn(ctx.instantiate(&artifact, &resolver)))
                .collect();
            driver.run();
            pending.iter().map(|c| c.try_take().unwrap().unwrap()).collect()
        };

        let interrupts = runtime.start_interrupts().unwrap();
        let start = Instant::now();
        let stats = {
            let mut driver = RoundRobin::new();
            for (ctx, instance) in ctxs.iter_mut().zip(&instances) {
                driver.spawn(ctx.invoke(instance, "spin", &[Val::I32(50_000_000)]));
            }
            driver.run().clone()
        };
        let elapsed = start.elapsed();
        let ticks = interrupts.stop();

        println!(
            "  {} context(s): {:?} rounds={} polls={} ticks={}",
            contexts, elapsed, stats.rounds, stats.polls, ticks
        );
    }
}

fn print_stats(name: &str, times: &[u64]) {
    if times.is_empty() {
        println!("  {}: no samples", name);
        return;
    }

    let mut sorted = times.to_vec();
    sorted.sort();

    let min = sorted[0];
    let max = sorted[sorted.len() - 1];
    let mean = times.iter().sum::<u64>() as f64 / times.len() as f64;
    let p50 = sorted[sorted.len() / 2];
    let p99 = sorted[(sorted.len() * 99) / 100];

    println!("  {}: n={} min={}us mean={:.1}us p50={}us p99={}us max={}us",
             name, times.len(), min, mean, p50, p99, max);
}
