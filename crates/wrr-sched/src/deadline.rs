//! Per-context epoch deadlines and the checkpoint decision.

use crate::epoch::EpochClock;
use crate::error::{Result, SchedError};

use serde::{Deserialize, Serialize};

/// What happens when guest execution reaches its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeadlinePolicy {
    /// Suspend the task and re-arm the deadline `interval` epochs ahead.
    #[default]
    YieldAndReschedule,
    /// End the task with [`SchedError::DeadlineExceeded`].
    TrapOnDeadline,
}

/// Outcome of a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    /// Keep executing.
    Continue,
    /// Suspend; the task resumes on its next poll.
    MustYield,
}

/// Deadline state owned by one execution context.
///
/// The sandbox calls [`EpochDeadline::checkpoint`] at its safe points
/// (function entries and loop headers for wasm). Only the driver thread
/// touches this value.
#[derive(Debug, Clone)]
pub struct EpochDeadline {
    clock: EpochClock,
    interval: u64,
    deadline: u64,
    policy: DeadlinePolicy,
    checks: u64,
    yields: u64,
}

impl EpochDeadline {
    /// Arm a deadline `interval` epochs after the clock's current value.
    pub fn new(clock: EpochClock, interval: u64, policy: DeadlinePolicy) -> Result<Self> {
        if interval == 0 {
            return Err(SchedError::Config(
                "deadline interval must be at least one epoch".to_string(),
            ));
        }
        let deadline = clock.read() + interval;
        Ok(Self {
            clock,
            interval,
            deadline,
            policy,
            checks: 0,
            yields: 0,
        })
    }

    /// Evaluate a checkpoint against the shared clock.
    ///
    /// Under [`DeadlinePolicy::YieldAndReschedule`] a reached deadline moves to
    /// `clock.read() + interval`, so one clock advance is observed by at most
    /// one checkpoint.
    pub fn checkpoint(&mut self) -> Result<Checkpoint> {
        self.checks += 1;
        let epoch = self.clock.read();
        if epoch < self.deadline {
            return Ok(Checkpoint::Continue);
        }

        match self.policy {
            DeadlinePolicy::YieldAndReschedule => {
                self.deadline = epoch + self.interval;
                self.yields += 1;
                tracing::trace!(epoch, next_deadline = self.deadline, "deadline reached, yielding");
                Ok(Checkpoint::MustYield)
            }
            DeadlinePolicy::TrapOnDeadline => Err(SchedError::DeadlineExceeded {
                deadline: self.deadline,
                epoch,
            }),
        }
    }

    /// Re-arm the deadline relative to the current clock value.
    pub fn rearm(&mut self) {
        self.deadline = self.clock.read() + self.interval;
    }

    /// Change the interval; takes effect at the next re-arm or yield.
    pub fn set_interval(&mut self, interval: u64) -> Result<()> {
        if interval == 0 {
            return Err(SchedError::Config(
                "deadline interval must be at least one epoch".to_string(),
            ));
        }
        self.interval = interval;
        Ok(())
    }

    /// Change the policy.
    pub fn set_policy(&mut self, policy: DeadlinePolicy) {
        self.policy = policy;
    }

    /// Current deadline (an epoch value).
    pub fn deadline(&self) -> u64 {
        self.deadline
    }

    /// Epochs granted between yields.
    pub fn interval(&self) -> u64 {
        self.interval
    }

    /// Active policy.
    pub fn policy(&self) -> DeadlinePolicy {
        self.policy
    }

    /// The clock this deadline is measured against.
    pub fn clock(&self) -> &EpochClock {
        &self.clock
    }

    /// Number of checkpoints evaluated.
    pub fn checks(&self) -> u64 {
        self.checks
    }

    /// Number of checkpoints that asked the guest to yield.
    pub fn yields(&self) -> u64 {
        self.yields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_interval_rejected() {
        let err = EpochDeadline::new(EpochClock::new(), 0, DeadlinePolicy::default()).unwrap_err();
        assert!(matches!(err, SchedError::Config(_)));

        let mut deadline = EpochDeadline::new(EpochClock::new(), 1, DeadlinePolicy::default()).unwrap();
        assert!(deadline.set_interval(0).is_err());
        assert_eq!(deadline.interval(), 1);
    }

    #[test]
    fn test_continue_before_deadline() {
        let clock = EpochClock::new();
        let mut deadline = EpochDeadline::new(clock.clone(), 2, DeadlinePolicy::YieldAndReschedule).unwrap();
        assert_eq!(deadline.deadline(), 2);
        assert_eq!(deadline.checkpoint().unwrap(), Checkpoint::Continue);
        clock.advance();
        assert_eq!(deadline.checkpoint().unwrap(), Checkpoint::Continue);
        assert_eq!(deadline.checks(), 2);
        assert_eq!(deadline.yields(), 0);
    }

    #[test]
    fn test_one_advance_one_yield() {
        let clock = EpochClock::new();
        let mut deadline = EpochDeadline::new(clock.clone(), 1, DeadlinePolicy::YieldAndReschedule).unwrap();

        clock.advance();
        assert_eq!(deadline.checkpoint().unwrap(), Checkpoint::MustYield);
        assert_eq!(deadline.deadline(), clock.read() + 1);

        // The same advance is not observed twice.
        for _ in 0..10 {
            assert_eq!(deadline.checkpoint().unwrap(), Checkpoint::Continue);
        }
        assert_eq!(deadline.yields(), 1);
    }

    #[test]
    fn test_late_checkpoint_reschedules_from_now() {
        let clock = EpochClock::new();
        let mut deadline = EpochDeadline::new(clock.clone(), 3, DeadlinePolicy::YieldAndReschedule).unwrap();
        for _ in 0..10 {
            clock.advance();
        }
        assert_eq!(deadline.checkpoint().unwrap(), Checkpoint::MustYield);
        assert_eq!(deadline.deadline(), 13);
    }

    #[test]
    fn test_trap_policy() {
        let clock = EpochClock::new();
        let mut deadline = EpochDeadline::new(clock.clone(), 1, DeadlinePolicy::TrapOnDeadline).unwrap();
        assert_eq!(deadline.checkpoint().unwrap(), Checkpoint::Continue);
        clock.advance();
        match deadline.checkpoint() {
            Err(SchedError::DeadlineExceeded { deadline, epoch }) => {
                assert_eq!(deadline, 1);
                assert_eq!(epoch, 1);
            }
            other => panic!("expected deadline exceeded, got {:?}", other),
        }
    }

    #[test]
    fn test_deadlines_are_per_context() {
        let clock = EpochClock::new();
        let mut fast = EpochDeadline::new(clock.clone(), 1, DeadlinePolicy::YieldAndReschedule).unwrap();
        let mut slow = EpochDeadline::new(clock.clone(), 2, DeadlinePolicy::YieldAndReschedule).unwrap();

        clock.advance();
        assert_eq!(fast.checkpoint().unwrap(), Checkpoint::MustYield);
        assert_eq!(slow.checkpoint().unwrap(), Checkpoint::Continue);

        clock.advance();
        assert_eq!(slow.checkpoint().unwrap(), Checkpoint::MustYield);
        assert_eq!(fast.checkpoint().unwrap(), Checkpoint::MustYield);
    }

    #[test]
    fn test_rearm() {
        let clock = EpochClock::new();
        let mut deadline = EpochDeadline::new(clock.clone(), 2, DeadlinePolicy::YieldAndReschedule).unwrap();
        for _ in 0..5 {
            clock.advance();
        }
        deadline.rearm();
        assert_eq!(deadline.deadline(), 7);
        assert_eq!(deadline.checkpoint().unwrap(), Checkpoint::Continue);
    }

    #[test]
    fn test_policy_serde() {
        let json = serde_json::to_string(&DeadlinePolicy::TrapOnDeadline).unwrap();
        assert_eq!(json, "\"trap-on-deadline\"");
        let policy: DeadlinePolicy = serde_json::from_str("\"yield-and-reschedule\"").unwrap();
        assert_eq!(policy, DeadlinePolicy::YieldAndReschedule);
    }
}
