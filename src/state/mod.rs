//! Shared in-memory state: the runtime cache, access times and the
//! single-flight primitive the other components deduplicate with.

mod access;
mod cache;
mod singleflight;

pub use access::AccessTracker;
pub use cache::{BranchMap, MirrorLease, RuntimeStateCache};
pub use singleflight::SingleFlight;

use std::sync::{Mutex, MutexGuard};

/// Lock a mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
