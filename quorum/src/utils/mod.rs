use std::sync::{Mutex, MutexGuard, PoisonError};

#[cfg(test)]
pub(crate) mod test_utils;

/// Locks a mutex, ignoring poisoning.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
