use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use super::lock_unpoisoned;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Running,
    Stopping,
    Stopped,
}

/// Serializes state transitions against request issuance.
///
/// Issuing a request happens inside [`LifecycleGuard::while_running`], so
/// once `begin_stop` has returned no new request can slip in. Callbacks
/// that arrive after `begin_stop` observe [`LifecycleGuard::is_abandoned`]
/// and must not touch scheduler state beyond releasing their frame.
#[derive(Debug)]
pub struct LifecycleGuard {
    state: Mutex<LifecycleState>,
    abandoned: AtomicBool,
}

impl LifecycleGuard {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LifecycleState::Created),
            abandoned: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *lock_unpoisoned(&self.state)
    }

    /// `Created -> Running`. Returns the actual state on failure.
    pub fn mark_running(&self) -> Result<(), LifecycleState> {
        let mut state = lock_unpoisoned(&self.state);
        if *state != LifecycleState::Created {
            return Err(*state);
        }
        *state = LifecycleState::Running;
        Ok(())
    }

    /// Runs `f` only if the scheduler is running, holding the state lock so
    /// a concurrent stop waits for `f` to finish.
    pub fn while_running<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let state = lock_unpoisoned(&self.state);
        if *state != LifecycleState::Running {
            return None;
        }
        let result = f();
        drop(state);
        Some(result)
    }

    /// Enters `Stopping` and abandons outstanding work. Returns the state
    /// the scheduler was in, or `None` if a stop already happened.
    pub fn begin_stop(&self) -> Option<LifecycleState> {
        let mut state = lock_unpoisoned(&self.state);
        let previous = *state;
        match previous {
            LifecycleState::Stopping | LifecycleState::Stopped => None,
            LifecycleState::Created | LifecycleState::Running => {
                *state = LifecycleState::Stopping;
                self.abandoned.store(true, Ordering::Release);
                Some(previous)
            }
        }
    }

    pub fn finish_stop(&self) {
        *lock_unpoisoned(&self.state) = LifecycleState::Stopped;
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::Acquire)
    }
}

impl Default for LifecycleGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts work that may still touch scheduler state: requests whose
/// callback has not returned, and consumer pulls in progress.
#[derive(Debug, Default)]
pub struct DrainBarrier {
    outstanding: Mutex<usize>,
    idle: Condvar,
}

impl DrainBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(self: &Arc<Self>) -> DrainToken {
        *lock_unpoisoned(&self.outstanding) += 1;
        DrainToken {
            barrier: Arc::clone(self),
        }
    }

    pub fn outstanding(&self) -> usize {
        *lock_unpoisoned(&self.outstanding)
    }

    /// Waits until nothing is outstanding. Returns `false` on timeout.
    pub fn wait_idle(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut outstanding = lock_unpoisoned(&self.outstanding);
        while *outstanding > 0 {
            outstanding = match deadline {
                None => self
                    .idle
                    .wait(outstanding)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    self.idle
                        .wait_timeout(outstanding, deadline - now)
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .0
                }
            };
        }
        true
    }

    fn leave(&self) {
        let mut outstanding = lock_unpoisoned(&self.outstanding);
        *outstanding = outstanding.saturating_sub(1);
        if *outstanding == 0 {
            self.idle.notify_all();
        }
    }
}

/// Keeps a [`DrainBarrier`] busy until dropped.
#[derive(Debug)]
pub struct DrainToken {
    barrier: Arc<DrainBarrier>,
}

impl Drop for DrainToken {
    fn drop(&mut self) {
        self.barrier.leave();
    }
}
