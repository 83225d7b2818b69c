pub mod async_frame_scheduler;
pub mod completion_gate;
pub mod error;
pub mod frame_slot;
pub mod lifecycle_guard;
pub mod scheduler_config;
pub mod slot_registry;
pub mod window_controller;

use std::sync::{Mutex, MutexGuard};

/// Locks `mutex`, recovering the data if a producer thread panicked while
/// holding it.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
