use std::fmt;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use super::lock_unpoisoned;

/// Result of waiting on a [`CompletionGate`].
#[derive(Debug, PartialEq, Eq)]
pub enum GateOutcome<T> {
    /// The gate was opened; the waiter now owns the value.
    Opened(T),
    /// The gate was cancelled, or its value was already taken.
    Cancelled,
    TimedOut,
}

/// Why [`CompletionGate::open`] refused a value. The value is handed back
/// so the caller can dispose of it.
#[derive(Debug, PartialEq, Eq)]
pub enum OpenError<T> {
    AlreadyOpened(T),
    Cancelled(T),
}

enum GateState<T> {
    Pending,
    Open(T),
    Taken,
    Cancelled,
}

/// One-shot wait/signal cell.
///
/// Exactly one `open` can succeed. A waiter blocks until the gate is opened,
/// cancelled, or its timeout expires; cancellation wakes every waiter.
pub struct CompletionGate<T> {
    state: Mutex<GateState<T>>,
    signal: Condvar,
}

impl<T> CompletionGate<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState::Pending),
            signal: Condvar::new(),
        }
    }

    pub fn open(&self, value: T) -> Result<(), OpenError<T>> {
        let mut state = lock_unpoisoned(&self.state);
        match &*state {
            GateState::Pending => {}
            GateState::Cancelled => return Err(OpenError::Cancelled(value)),
            GateState::Open(_) | GateState::Taken => return Err(OpenError::AlreadyOpened(value)),
        }
        *state = GateState::Open(value);
        drop(state);
        self.signal.notify_all();
        Ok(())
    }

    /// Cancels the gate and wakes waiters. A value that was delivered but
    /// never taken is returned to the caller.
    pub fn cancel(&self) -> Option<T> {
        let mut state = lock_unpoisoned(&self.state);
        let previous = std::mem::replace(&mut *state, GateState::Cancelled);
        drop(state);
        self.signal.notify_all();
        match previous {
            GateState::Open(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(*lock_unpoisoned(&self.state), GateState::Pending)
    }

    /// Blocks until the gate leaves the pending state. `None` waits forever.
    pub fn wait(&self, timeout: Option<Duration>) -> GateOutcome<T> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = lock_unpoisoned(&self.state);
        loop {
            match std::mem::replace(&mut *state, GateState::Taken) {
                GateState::Open(value) => return GateOutcome::Opened(value),
                GateState::Pending => *state = GateState::Pending,
                other => {
                    *state = other;
                    return GateOutcome::Cancelled;
                }
            }

            state = match deadline {
                None => self
                    .signal
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return GateOutcome::TimedOut;
                    }
                    self.signal
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .0
                }
            };
        }
    }
}

impl<T> Default for CompletionGate<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for CompletionGate<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match *lock_unpoisoned(&self.state) {
            GateState::Pending => "pending",
            GateState::Open(_) => "open",
            GateState::Taken => "taken",
            GateState::Cancelled => "cancelled",
        };
        f.debug_struct("CompletionGate").field("state", &state).finish()
    }
}
