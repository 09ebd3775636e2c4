//! Round-robin driver.
//!
//! [`RoundRobin`] owns an ordered set of tasks. A round polls every live task
//! exactly once, in insertion order; a task that reaches a terminal state is
//! removed and its result handed to whoever registered it. Rounds repeat until
//! the set is empty.
//!
//! Fairness is at checkpoint granularity. A guest that runs long stretches
//! between checkpoints delays everyone else for that long, and a guest that
//! never reaches a checkpoint (an infinite loop with no calls or loop
//! headers the sandbox instruments) keeps its `poll` from returning, which
//! stalls the driver forever. That is an authoring error in the guest.

use crate::error::Result;
use crate::task::{Task, TaskId, TaskState, TaskStats};

use serde::Serialize;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::task::Poll;

/// Result slot for a task spawned with [`RoundRobin::spawn`].
#[derive(Debug)]
pub struct Completion<T> {
    id: TaskId,
    rx: Receiver<Result<T>>,
}

impl<T> Completion<T> {
    /// Id of the task feeding this slot.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Take the result if the task has finished.
    ///
    /// Returns `None` while the task is still live. The result can be taken
    /// once; later calls return `None`.
    pub fn try_take(&self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }
}

/// Summary of a terminal task, kept by the driver.
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    /// Task id
    pub id: TaskId,
    /// Task label
    pub label: String,
    /// Terminal state
    pub state: TaskState,
    /// Counters at completion
    pub stats: TaskStats,
    /// Round in which the task finished (1-based)
    pub finished_in_round: u64,
}

/// Aggregate driver counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DriverStats {
    /// Rounds executed
    pub rounds: u64,
    /// Total polls issued
    pub polls: u64,
    /// Tasks that completed
    pub completed: u64,
    /// Tasks that trapped
    pub trapped: u64,
    /// Tasks that failed host-side
    pub failed: u64,
    /// One report per finished task, in finishing order
    pub finished: Vec<TaskReport>,
}

trait Slot {
    fn id(&self) -> TaskId;
    /// Poll once; on a terminal result deliver it and return the final state.
    fn step(&mut self) -> Poll<TaskState>;
    fn report(&self, round: u64) -> TaskReport;
}

struct Registered<'a, T> {
    task: Task<'a, T>,
    deliver: Option<Box<dyn FnOnce(Result<T>) + 'a>>,
}

impl<'a, T> Slot for Registered<'a, T> {
    fn id(&self) -> TaskId {
        self.task.id()
    }

    fn step(&mut self) -> Poll<TaskState> {
        match self.task.poll() {
            Poll::Pending => Poll::Pending,
            Poll::Ready(result) => {
                if let Some(deliver) = self.deliver.take() {
                    deliver(result);
                }
                Poll::Ready(self.task.state())
            }
        }
    }

    fn report(&self, round: u64) -> TaskReport {
        TaskReport {
            id: self.task.id(),
            label: self.task.label().to_string(),
            state: self.task.state(),
            stats: self.task.stats(),
            finished_in_round: round,
        }
    }
}

/// Cooperative round-robin scheduler over [`Task`]s.
///
/// The lifetime bounds the tasks it holds, and through them the execution
/// contexts they borrow.
#[derive(Default)]
pub struct RoundRobin<'a> {
    queue: Vec<Box<dyn Slot + 'a>>,
    stats: DriverStats,
}

impl<'a> RoundRobin<'a> {
    /// Create an empty driver.
    pub fn new() -> Self {
        Self {
            queue: Vec::new(),
            stats: DriverStats::default(),
        }
    }

    /// Add a task; its result is delivered to `on_done` when it finishes.
    pub fn spawn_with<T, F>(&mut self, task: Task<'a, T>, on_done: F) -> TaskId
    where
        T: 'a,
        F: FnOnce(Result<T>) + 'a,
    {
        let id = task.id();
        tracing::debug!(task = %id, label = %task.label(), position = self.queue.len(), "task scheduled");
        self.queue.push(Box::new(Registered {
            task,
            deliver: Some(Box::new(on_done)),
        }));
        id
    }

    /// Add a task; its result lands in the returned [`Completion`].
    pub fn spawn<T: 'a>(&mut self, task: Task<'a, T>) -> Completion<T> {
        let (tx, rx) = mpsc::sync_channel(1);
        let id = self.spawn_with(task, move |result| {
            // The completion may have been dropped; the result is discarded then.
            let _ = tx.send(result);
        });
        Completion { id, rx }
    }

    /// Number of live tasks.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True when no task is left.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Ids of the live tasks in polling order.
    pub fn pending(&self) -> Vec<TaskId> {
        self.queue.iter().map(|slot| slot.id()).collect()
    }

    /// Poll every live task once. Returns how many tasks finished.
    pub fn run_round(&mut self) -> usize {
        if self.queue.is_empty() {
            return 0;
        }
        self.stats.rounds += 1;
        let round = self.stats.rounds;
        let stats = &mut self.stats;
        let before = self.queue.len();

        self.queue.retain_mut(|slot| {
            stats.polls += 1;
            match slot.step() {
                Poll::Pending => true,
                Poll::Ready(state) => {
                    match state {
                        TaskState::Completed => stats.completed += 1,
                        TaskState::Trapped => stats.trapped += 1,
                        _ => stats.failed += 1,
                    }
                    stats.finished.push(slot.report(round));
                    false
                }
            }
        });

        let finished = before - self.queue.len();
        tracing::trace!(round, live = self.queue.len(), finished, "round complete");
        finished
    }

    /// Run rounds until every task has finished.
    pub fn run(&mut self) -> &DriverStats {
        while !self.queue.is_empty() {
            self.run_round();
        }
        tracing::debug!(
            rounds = self.stats.rounds,
            completed = self.stats.completed,
            trapped = self.stats.trapped,
            failed = self.stats.failed,
            "driver idle"
        );
        &self.stats
    }

    /// Counters so far.
    pub fn stats(&self) -> &DriverStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deadline::{DeadlinePolicy, EpochDeadline};
    use crate::epoch::EpochClock;
    use crate::error::SchedError;
    use crate::testing::ScriptedGuest;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn context(clock: &EpochClock, interval: u64) -> Rc<RefCell<EpochDeadline>> {
        Rc::new(RefCell::new(
            EpochDeadline::new(clock.clone(), interval, DeadlinePolicy::YieldAndReschedule).unwrap(),
        ))
    }

    /// Runs rounds, advancing the clock before each one like an interrupt would.
    fn run_ticking(driver: &mut RoundRobin<'_>, clock: &EpochClock) {
        while !driver.is_empty() {
            clock.advance();
            driver.run_round();
        }
    }

    #[test]
    fn test_empty_driver() {
        let mut driver = RoundRobin::new();
        assert!(driver.is_empty());
        assert_eq!(driver.run_round(), 0);
        assert_eq!(driver.run().rounds, 0);
    }

    #[test]
    fn test_each_task_visited_once_per_round() {
        let clock = EpochClock::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let names = ["a", "b", "c"];
        let mut driver = RoundRobin::new();
        let mut slots = Vec::new();
        for name in names {
            let guest = ScriptedGuest::new(context(&clock, 1), 4).record(log.clone(), name);
            slots.push(driver.spawn(Task::new(name, guest.boxed())));
        }

        run_ticking(&mut driver, &clock);

        // Every guest yields at each of its 4 checkpoints, then finishes on the 5th poll.
        let log = log.borrow();
        assert_eq!(log.len(), 15);
        for round in log.chunks(names.len()) {
            assert_eq!(round, names);
        }
        for slot in &slots {
            assert!(matches!(slot.try_take(), Some(Ok(4))));
        }
    }

    #[test]
    fn test_short_task_leaves_rotation_early() {
        let clock = EpochClock::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut driver = RoundRobin::new();
        driver.spawn(Task::new("long", ScriptedGuest::new(context(&clock, 1), 3).record(log.clone(), "long").boxed()));
        driver.spawn(Task::new("short", ScriptedGuest::new(context(&clock, 1), 1).record(log.clone(), "short").boxed()));

        run_ticking(&mut driver, &clock);

        assert_eq!(
            *log.borrow(),
            vec!["long", "short", "long", "short", "long", "long"]
        );
        let stats = driver.stats();
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.finished[0].label, "short");
        assert_eq!(stats.finished[0].finished_in_round, 2);
        assert_eq!(stats.finished[1].label, "long");
        assert_eq!(stats.finished[1].finished_in_round, 4);
    }

    #[test]
    fn test_failure_does_not_abort_loop() {
        let clock = EpochClock::new();
        let mut driver = RoundRobin::new();
        let faulty = driver.spawn(Task::new("faulty", ScriptedGuest::new(context(&clock, 1), 5).fault_at(2).boxed()));
        let rejected = driver.spawn(Task::<u32>::rejected("rejected", SchedError::host("no such export")));
        let healthy = driver.spawn(Task::new("healthy", ScriptedGuest::new(context(&clock, 1), 3).boxed()));

        run_ticking(&mut driver, &clock);

        assert!(matches!(faulty.try_take(), Some(Err(SchedError::Trap(_)))));
        assert!(matches!(rejected.try_take(), Some(Err(SchedError::Host(_)))));
        assert!(matches!(healthy.try_take(), Some(Ok(3))));

        let stats = driver.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.trapped, 1);
        assert_eq!(stats.failed, 1);
    }

    #[test]
    fn test_callback_delivery() {
        let clock = EpochClock::new();
        let results = Rc::new(RefCell::new(Vec::new()));
        let mut driver = RoundRobin::new();
        for steps in [2u32, 1, 3] {
            let sink = results.clone();
            driver.spawn_with(Task::new("cb", ScriptedGuest::new(context(&clock, 1), steps).boxed()), move |r| {
                sink.borrow_mut().push(r.unwrap());
            });
        }
        run_ticking(&mut driver, &clock);
        assert_eq!(*results.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn test_completion_taken_once() {
        let clock = EpochClock::new();
        let mut driver = RoundRobin::new();
        let slot = driver.spawn(Task::new("once", ScriptedGuest::new(context(&clock, 1), 1).boxed()));
        assert!(slot.try_take().is_none());
        driver.run();
        assert!(matches!(slot.try_take(), Some(Ok(1))));
        assert!(slot.try_take().is_none());
    }

    #[test]
    fn test_tasks_sharing_context_run_one_at_a_time() {
        // ScriptedGuest panics if two guests hold the same context at once.
        let clock = EpochClock::new();
        let shared = context(&clock, 1);
        let mut driver = RoundRobin::new();
        let first = driver.spawn(Task::new("first", ScriptedGuest::new(shared.clone(), 6).boxed()));
        let second = driver.spawn(Task::new("second", ScriptedGuest::new(shared.clone(), 6).boxed()));

        run_ticking(&mut driver, &clock);

        assert!(matches!(first.try_take(), Some(Ok(6))));
        assert!(matches!(second.try_take(), Some(Ok(6))));
    }

    #[test]
    fn test_pending_order_is_insertion_order() {
        let clock = EpochClock::new();
        let mut driver = RoundRobin::new();
        let a = driver.spawn(Task::new("a", ScriptedGuest::new(context(&clock, 1), 2).boxed()));
        let b = driver.spawn(Task::new("b", ScriptedGuest::new(context(&clock, 1), 2).boxed()));
        assert_eq!(driver.pending(), vec![a.id(), b.id()]);
        assert_eq!(driver.len(), 2);
    }
}
