//! Epoch clock and the background interrupt driver.
//!
//! An [`EpochClock`] is the only interrupt signal in the system. Every
//! execution context created from one runtime holds a clone of the same
//! clock; advancing it makes each context's next checkpoint compare its
//! deadline against the new value.
//!
//! The [`InterruptDriver`] advances a clock from a dedicated thread at a
//! fixed wall-clock interval until its [`InterruptHandle`] is stopped or
//! dropped.

use crate::error::Result;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Receiver of clock pulses.
///
/// The sandbox only consults its checkpoint hook once its own epoch moves,
/// so the clock forwards every advance to a sink.
pub trait EpochSink: Send + Sync {
    /// Called after the clock moved to `epoch`.
    fn on_advance(&self, epoch: u64);
}

struct ClockInner {
    ticks: AtomicU64,
    sink: Option<Box<dyn EpochSink>>,
}

/// Shared, monotonically increasing epoch counter.
///
/// Cloning yields another handle to the same counter.
#[derive(Clone)]
pub struct EpochClock {
    inner: Arc<ClockInner>,
}

impl EpochClock {
    /// Create a standalone clock starting at zero.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ClockInner {
                ticks: AtomicU64::new(0),
                sink: None,
            }),
        }
    }

    /// Create a clock that pulses `sink` on every advance.
    pub fn with_sink(sink: impl EpochSink + 'static) -> Self {
        Self {
            inner: Arc::new(ClockInner {
                ticks: AtomicU64::new(0),
                sink: Some(Box::new(sink)),
            }),
        }
    }

    /// Advance the clock by one and return the new epoch.
    pub fn advance(&self) -> u64 {
        let epoch = self.inner.ticks.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some(sink) = &self.inner.sink {
            sink.on_advance(epoch);
        }
        epoch
    }

    /// Current epoch.
    pub fn read(&self) -> u64 {
        self.inner.ticks.load(Ordering::Acquire)
    }

    /// True if both handles refer to the same counter.
    pub fn same(&self, other: &EpochClock) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for EpochClock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EpochClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EpochClock")
            .field("epoch", &self.read())
            .field("sink", &self.inner.sink.is_some())
            .finish()
    }
}

/// Background timer that advances an [`EpochClock`] at a fixed interval.
#[derive(Debug, Clone)]
pub struct InterruptDriver {
    interval: Duration,
    name: String,
}

impl InterruptDriver {
    /// Create a driver that fires every `interval`.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            name: "wrr-interrupt".to_string(),
        }
    }

    /// Builder: set the thread name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Get the interval between interrupts.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start advancing `clock` on a background thread.
    pub fn spawn(self, clock: EpochClock) -> Result<InterruptHandle> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let interval = self.interval;

        let thread = thread::Builder::new().name(self.name.clone()).spawn(move || {
            let mut sent = 0u64;
            loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let epoch = clock.advance();
                        sent += 1;
                        tracing::trace!(epoch, "sending an interrupt");
                    }
                    // Explicit stop, or the handle went away.
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            sent
        })?;

        tracing::debug!(name = %self.name, interval_ms = interval.as_millis() as u64, "interrupt driver started");

        Ok(InterruptHandle {
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }
}

/// Handle to a running [`InterruptDriver`]. Dropping it stops the thread.
#[derive(Debug)]
pub struct InterruptHandle {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<u64>>,
}

impl InterruptHandle {
    /// Stop the driver, wait for its thread and return how many interrupts it sent.
    pub fn stop(mut self) -> u64 {
        self.shutdown()
    }

    fn shutdown(&mut self) -> u64 {
        if let Some(stop) = self.stop.take() {
            // The thread may already be gone; nothing to report then.
            let _ = stop.send(());
        }
        match self.thread.take().map(JoinHandle::join) {
            Some(Ok(sent)) => {
                tracing::debug!(sent, "interrupt driver stopped");
                sent
            }
            Some(Err(_)) => {
                tracing::warn!("interrupt driver thread panicked");
                0
            }
            None => 0,
        }
    }
}

impl Drop for InterruptHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    struct CountingSink(Arc<AtomicUsize>);

    impl EpochSink for CountingSink {
        fn on_advance(&self, _epoch: u64) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_clock_starts_at_zero() {
        let clock = EpochClock::new();
        assert_eq!(clock.read(), 0);
        assert_eq!(clock.advance(), 1);
        assert_eq!(clock.advance(), 2);
        assert_eq!(clock.read(), 2);
    }

    #[test]
    fn test_clones_share_counter() {
        let clock = EpochClock::new();
        let other = clock.clone();
        other.advance();
        assert_eq!(clock.read(), 1);
        assert!(clock.same(&other));
        assert!(!clock.same(&EpochClock::new()));
    }

    #[test]
    fn test_sink_pulsed_per_advance() {
        let pulses = Arc::new(AtomicUsize::new(0));
        let clock = EpochClock::with_sink(CountingSink(pulses.clone()));
        for _ in 0..5 {
            clock.advance();
        }
        assert_eq!(pulses.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_concurrent_advance() {
        let clock = EpochClock::new();
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let clock = clock.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        clock.advance();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(clock.read(), 4000);
    }

    #[test]
    fn test_interrupt_driver_advances_and_stops() {
        let clock = EpochClock::new();
        let handle = InterruptDriver::new(Duration::from_millis(1))
            .spawn(clock.clone())
            .expect("spawn interrupt driver");

        let started = Instant::now();
        while clock.read() < 3 && started.elapsed() < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(1));
        }
        let sent = handle.stop();
        assert!(sent >= 3, "sent {} interrupts", sent);

        // No more interrupts after stop.
        let frozen = clock.read();
        assert_eq!(frozen, sent);
        thread::sleep(Duration::from_millis(10));
        assert_eq!(clock.read(), frozen);
    }

    #[test]
    fn test_drop_stops_driver() {
        let clock = EpochClock::new();
        {
            let _handle = InterruptDriver::new(Duration::from_secs(60))
                .name("idle-interrupt")
                .spawn(clock.clone())
                .expect("spawn interrupt driver");
        }
        assert_eq!(clock.read(), 0);
    }
}
