//! Internal synchronization helpers.

use std::sync::{Mutex, MutexGuard};

/// Acquire a std mutex, recovering the guard if a previous holder panicked.
///
/// Shared registries hold plain counters and maps; a poisoned lock leaves
/// them in a consistent state, so recovery is always safe here.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
