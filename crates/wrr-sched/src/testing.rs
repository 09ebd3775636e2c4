//! Scripted guests for exercising tasks and the driver without a sandbox.

use crate::deadline::{Checkpoint, EpochDeadline};
use crate::error::{Result, SchedError};
use crate::task::GuestCall;

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

/// A guest that runs `steps` checkpoints and returns the number of steps.
///
/// Every step borrows its context mutably for the duration of the step, so
/// two guests running on one context at once would panic.
pub struct ScriptedGuest {
    ctx: Rc<RefCell<EpochDeadline>>,
    steps: u32,
    done: u32,
    fault_at: Option<u32>,
    log: Option<(Rc<RefCell<Vec<&'static str>>>, &'static str)>,
}

impl ScriptedGuest {
    pub fn new(ctx: Rc<RefCell<EpochDeadline>>, steps: u32) -> Self {
        Self {
            ctx,
            steps,
            done: 0,
            fault_at: None,
            log: None,
        }
    }

    /// Trap when reaching checkpoint `step` (1-based).
    pub fn fault_at(mut self, step: u32) -> Self {
        self.fault_at = Some(step);
        self
    }

    /// Append `name` to `log` every time the guest is resumed.
    pub fn record(mut self, log: Rc<RefCell<Vec<&'static str>>>, name: &'static str) -> Self {
        self.log = Some((log, name));
        self
    }

    pub fn boxed(self) -> GuestCall<'static, u32> {
        Box::pin(self)
    }
}

impl Future for ScriptedGuest {
    type Output = Result<u32>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some((log, name)) = &this.log {
            log.borrow_mut().push(*name);
        }

        while this.done < this.steps {
            this.done += 1;
            if this.fault_at == Some(this.done) {
                return Poll::Ready(Err(SchedError::Trap(format!(
                    "unreachable executed at step {}",
                    this.done
                ))));
            }
            let mut ctx = this
                .ctx
                .try_borrow_mut()
                .expect("context already running another task");
            match ctx.checkpoint() {
                Ok(Checkpoint::Continue) => {}
                Ok(Checkpoint::MustYield) => return Poll::Pending,
                Err(e) => return Poll::Ready(Err(e)),
            }
        }
        Poll::Ready(Ok(this.done))
    }
}
