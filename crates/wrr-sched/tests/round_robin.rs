//! Integration tests: real guests interleaved by a background interrupt driver.
//!
//! The guest busy-waits on the `wrr::epoch` host import, so it can only finish
//! once the interrupt thread has advanced the clock, and every advance forces
//! a yield at the next loop header.

#![cfg(feature = "wasm")]

use std::cell::RefCell;
use std::rc::Rc;

use wrr_sched::wasm::Val;
use wrr_sched::{
    DeadlinePolicy, RoundRobin, Runtime, RuntimeConfig, SchedError, TaskState,
};

const GUEST_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/wait.wat");

fn runtime() -> Runtime {
    Runtime::new(RuntimeConfig::default().tick_interval_ms(1)).expect("failed to create runtime")
}

#[test]
fn test_two_contexts_share_one_artifact() {
    let runtime = runtime();
    let artifact = runtime.compile_file(GUEST_PATH).expect("failed to load guest");
    assert_eq!(artifact.name(), "wait");
    let resolver = runtime.resolver().unwrap();

    let mut a = runtime.context().unwrap();
    let mut b = runtime.context().unwrap();

    let (ia, ib) = {
        let mut driver = RoundRobin::new();
        let ia = driver.spawn(a.instantiate(&artifact, &resolver));
        let ib = driver.spawn(b.instantiate(&artifact, &resolver));
        let stats = driver.run();
        assert_eq!(stats.completed, 2);
        (
            ia.try_take().expect("instance a").expect("instantiate a"),
            ib.try_take().expect("instance b").expect("instantiate b"),
        )
    };
    assert_ne!(ia.context(), ib.context());

    let interrupts = runtime.start_interrupts().unwrap();
    let order = Rc::new(RefCell::new(Vec::new()));
    let stats = {
        let mut driver = RoundRobin::new();
        let log = order.clone();
        driver.spawn_with(a.invoke(&ia, "wait", &[Val::I64(3)]), move |r| {
            assert!(r.is_ok());
            log.borrow_mut().push("a");
        });
        let log = order.clone();
        driver.spawn_with(b.invoke(&ib, "wait", &[Val::I64(3)]), move |r| {
            assert!(r.is_ok());
            log.borrow_mut().push("b");
        });
        driver.run().clone()
    };
    let ticks = interrupts.stop();

    assert!(ticks >= 3);
    assert_eq!(stats.completed, 2);
    assert!(stats.rounds > 1);
    assert_eq!(order.borrow().len(), 2);
    for report in &stats.finished {
        assert_eq!(report.state, TaskState::Completed);
        assert!(report.stats.yields >= 1, "{} never yielded", report.label);
    }
    assert!(a.yields() >= 1);
    assert!(b.yields() >= 1);
}

#[test]
fn test_trap_does_not_stop_other_tasks() {
    let runtime = runtime();
    let artifact = runtime.compile_file(GUEST_PATH).unwrap();
    let resolver = runtime.resolver().unwrap();

    let mut healthy = runtime.context().unwrap();
    let mut doomed = runtime.context().unwrap();
    let ih = {
        let mut driver = RoundRobin::new();
        let c = driver.spawn(healthy.instantiate(&artifact, &resolver));
        driver.run();
        c.try_take().unwrap().unwrap()
    };
    let id = {
        let mut driver = RoundRobin::new();
        let c = driver.spawn(doomed.instantiate(&artifact, &resolver));
        driver.run();
        c.try_take().unwrap().unwrap()
    };

    let interrupts = runtime.start_interrupts().unwrap();
    {
        let mut driver = RoundRobin::new();
        let crash = driver.spawn(doomed.invoke(&id, "crash", &[]));
        let wait = driver.spawn(healthy.invoke(&ih, "wait", &[Val::I64(2)]));
        let stats = driver.run();
        assert_eq!(stats.trapped, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.finished[0].finished_in_round, 1);
        assert!(matches!(crash.try_take(), Some(Err(SchedError::Trap(_)))));
        assert!(matches!(wait.try_take(), Some(Ok(_))));
    }
    interrupts.stop();

    assert!(doomed.is_poisoned());
    assert!(!healthy.is_poisoned());
}

#[test]
fn test_trap_on_deadline_under_interrupts() {
    let runtime = runtime();
    let artifact = runtime.compile_file(GUEST_PATH).unwrap();
    let resolver = runtime.resolver().unwrap();
    let mut ctx = runtime.context_with(2, DeadlinePolicy::TrapOnDeadline).unwrap();

    let instance = {
        let mut driver = RoundRobin::new();
        let c = driver.spawn(ctx.instantiate(&artifact, &resolver));
        driver.run();
        c.try_take().unwrap().unwrap()
    };

    let interrupts = runtime.start_interrupts().unwrap();
    let result = {
        let mut driver = RoundRobin::new();
        let c = driver.spawn(ctx.invoke(&instance, "wait", &[Val::I64(1_000)]));
        let stats = driver.run();
        assert_eq!(stats.trapped, 1);
        assert_eq!(stats.rounds, 1);
        c.try_take().unwrap()
    };
    interrupts.stop();

    assert!(matches!(result, Err(SchedError::DeadlineExceeded { .. })));
    assert!(ctx.is_poisoned());
}
