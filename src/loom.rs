//! Atomics that are swapped for `loom`'s under `cfg(loom)`, so the segment table can be model
//! checked.

#[cfg(loom)]
pub(crate) use loom::sync::atomic::{AtomicPtr, Ordering};

#[cfg(not(loom))]
pub(crate) use core::sync::atomic::{AtomicPtr, Ordering};

/// Access the pointer behind a uniquely borrowed `AtomicPtr` without synchronizing.
#[cfg(not(loom))]
#[inline(always)]
pub(crate) fn with_mut<T, R>(ptr: &mut AtomicPtr<T>, f: impl FnOnce(&mut *mut T) -> R) -> R {
    f(ptr.get_mut())
}

#[cfg(loom)]
pub(crate) fn with_mut<T, R>(ptr: &mut AtomicPtr<T>, f: impl FnOnce(&mut *mut T) -> R) -> R {
    ptr.with_mut(f)
}
