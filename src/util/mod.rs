use std::sync::{Mutex, MutexGuard};

pub mod hash_table;
pub mod random;

/// All tables in this crate are mutated under short-lived locks and remain
/// structurally sound even if a holder panicked, so a poisoned lock is not
/// propagated - we keep serving.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
