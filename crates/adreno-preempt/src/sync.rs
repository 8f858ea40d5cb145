//! Synchronisation primitives used by the preemption controller.
//!
//! Under `cfg(all(feature = "loom", test))` the state word, ring pointers and per-ring locks are
//! loom primitives so the unit tests can model-check the interleavings. Device memory buffers
//! always use std atomics; they are ordered by the explicit fences issued around them.

#[cfg(all(feature = "loom", test))]
pub(crate) use loom::sync::atomic::{fence, AtomicU32, AtomicU64, AtomicUsize};
#[cfg(all(feature = "loom", test))]
pub(crate) use loom::sync::{Mutex, MutexGuard};

#[cfg(not(all(feature = "loom", test)))]
pub(crate) use std::sync::atomic::{fence, AtomicU32, AtomicU64, AtomicUsize};
#[cfg(not(all(feature = "loom", test)))]
pub(crate) use std::sync::{Mutex, MutexGuard};

/// Lock a mutex, recovering the data if a previous holder panicked.
///
/// The guarded data is plain-old-data (pointers and flags), so a panic mid-update cannot leave it
/// logically inconsistent beyond what the next writer overwrites.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(all(feature = "loom", test))]
#[inline]
pub(crate) fn spin_loop() {
    loom::thread::yield_now();
}

#[cfg(not(all(feature = "loom", test)))]
#[inline]
pub(crate) fn spin_loop() {
    std::hint::spin_loop();
}
