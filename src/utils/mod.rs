//! Utility modules for streamsplice
//!
//! Cancellation handles and small synchronization helpers shared by the
//! adapters, the linker and the bridge.

pub mod cancel;

pub use cancel::{CancelHandle, make_cancellable_stream};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a state mutex, recovering the guard if a previous holder panicked.
///
/// State blocks are only mutated through short, non-panicking sections, so the
/// data behind a poisoned lock is still consistent.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
