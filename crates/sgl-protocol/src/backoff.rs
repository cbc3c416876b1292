//! Polling policy for register waits.
//!
//! Neither peer has a wakeup primitive that crosses the segment, so every wait
//! is a poll loop. [`Backoff`] escalates from busy-spinning to thread yields to
//! exponentially growing sleeps, with an optional deadline and an optional
//! cancellation flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::WaitError;

/// One step of a poll loop.
///
/// The cycle and handshake functions call [`Wait::wait`] between register
/// polls; tests substitute implementations that yield to a model checker.
pub trait Wait {
    fn wait(&mut self) -> Result<(), WaitError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpinPolicy {
    /// Polls answered with `spin_loop` before yielding.
    pub spins: u32,
    /// Polls answered with `yield_now` after spinning.
    pub yields: u32,
    pub initial_sleep: Duration,
    pub max_sleep: Duration,
    /// Overall deadline for a single wait; `None` waits forever.
    pub timeout: Option<Duration>,
}

impl Default for SpinPolicy {
    fn default() -> Self {
        Self {
            spins: 64,
            yields: 32,
            initial_sleep: Duration::from_micros(10),
            max_sleep: Duration::from_millis(1),
            timeout: Some(Duration::from_secs(10)),
        }
    }
}

impl SpinPolicy {
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.clone())
    }

    /// Like [`SpinPolicy::backoff`], but every wait fails with
    /// [`WaitError::Cancelled`] once `cancel` is set.
    pub fn backoff_with_cancel(&self, cancel: Arc<AtomicBool>) -> Backoff {
        let mut backoff = self.backoff();
        backoff.cancel = Some(cancel);
        backoff
    }
}

/// What the next [`Backoff::wait`] call will do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delay {
    Spin,
    Yield,
    Sleep(Duration),
}

#[derive(Debug)]
pub struct Backoff {
    policy: SpinPolicy,
    attempts: u32,
    sleep: Duration,
    started: Instant,
    cancel: Option<Arc<AtomicBool>>,
}

impl Backoff {
    pub fn new(policy: SpinPolicy) -> Self {
        let sleep = policy.initial_sleep;
        Self {
            policy,
            attempts: 0,
            sleep,
            started: Instant::now(),
            cancel: None,
        }
    }

    /// Restarts the escalation and the deadline, keeping the cancel flag.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.sleep = self.policy.initial_sleep;
        self.started = Instant::now();
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn next_delay(&self) -> Delay {
        let spins = self.policy.spins;
        if self.attempts < spins {
            Delay::Spin
        } else if self.attempts < spins.saturating_add(self.policy.yields) {
            Delay::Yield
        } else {
            Delay::Sleep(self.sleep.min(self.policy.max_sleep))
        }
    }
}

impl Wait for Backoff {
    fn wait(&mut self) -> Result<(), WaitError> {
        if self
            .cancel
            .as_ref()
            .is_some_and(|cancel| cancel.load(Ordering::SeqCst))
        {
            return Err(WaitError::Cancelled);
        }
        if let Some(timeout) = self.policy.timeout {
            let waited = self.started.elapsed();
            if waited >= timeout {
                return Err(WaitError::TimedOut { waited });
            }
        }

        match self.next_delay() {
            Delay::Spin => std::hint::spin_loop(),
            Delay::Yield => std::thread::yield_now(),
            Delay::Sleep(duration) => {
                std::thread::sleep(duration);
                self.sleep = duration.saturating_mul(2).min(self.policy.max_sleep);
            }
        }
        self.attempts = self.attempts.saturating_add(1);
        Ok(())
    }
}
