//! The shared state behind a [`Vector`](crate::Vector): an immutable [`Descriptor`] snapshot and
//! the single pending [`WriteRecord`] it may carry.
//!
//! Every element lives in its own heap cell, reached through an atomic pointer in its [`Slot`].
//! A write record replaces one cell pointer with another in a single compare-and-swap. The cell it
//! replaces stays owned by the record and is freed only when the record's descriptor is, which
//! happens through `crossbeam_epoch` once the descriptor has been superseded and no pinned thread
//! can still reach it. An address a helper may compare against therefore cannot be reused, and
//! slots never return to null after their first write, so a delayed helper's stale CAS never
//! succeeds.

use core::sync::atomic::{AtomicBool, Ordering};

use alloc::boxed::Box;
use crossbeam_epoch::{Atomic, Guard, Owned, Shared};

use crate::buckets::{buckets_for_index_bits, Buckets, Index};

/// The maximum number of segments, 32 wherever the index space allows it.
pub(crate) const BUCKETS: usize = {
    let max = buckets_for_index_bits(usize::BITS - 1);
    if max < 32 {
        max
    } else {
        32
    }
};

pub(crate) type Slots<T> = Buckets<Slot<T>, BUCKETS>;

/// One element position. Null until the first write lands.
pub(crate) struct Slot<T> {
    cell: Atomic<T>,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            cell: Atomic::null(),
        }
    }
}

impl<T> Slot<T> {
    /// Load the current cell pointer.
    #[inline]
    pub(crate) fn load<'g>(&self, guard: &'g Guard) -> Shared<'g, T> {
        // `Acquire` pairs with the `AcqRel` install in `WriteRecord::complete`, making the cell's
        // contents visible.
        self.cell.load(Ordering::Acquire, guard)
    }

    /// Clone the current value, or the default if nothing was ever written here.
    #[inline]
    pub(crate) fn read(&self, guard: &Guard) -> T
    where
        T: Clone + Default,
    {
        // Safety: Cells are only freed through the collector and we are pinned.
        unsafe { self.load(guard).as_ref() }
            .cloned()
            .unwrap_or_default()
    }
}

impl<T> Drop for Slot<T> {
    fn drop(&mut self) {
        // Safety: Slots are only dropped along with their segment, which requires unique access
        // to the whole vector.
        unsafe {
            let cell = self.cell.load(Ordering::Relaxed, crossbeam_epoch::unprotected());
            if !cell.is_null() {
                drop(cell.into_owned());
            }
        }
    }
}

/// A pending replacement of one slot's cell.
pub(crate) struct WriteRecord<T> {
    /// The slot being written.
    index: Index<BUCKETS>,
    /// The cell the slot held when the record was built, possibly null. Owned by the record once
    /// it completes.
    expected: *const T,
    /// The cell to install. Owned by whoever built the record until it is published, then by the
    /// slot.
    new: *const T,
    completed: AtomicBool,
}

// Safety: A record drops its `expected` cell on whichever thread frees it and lets other threads
// clone that cell, so it needs both `T: Send` and `T: Sync`.
unsafe impl<T: Send + Sync> Send for WriteRecord<T> {}
unsafe impl<T: Send + Sync> Sync for WriteRecord<T> {}

impl<T> WriteRecord<T> {
    /// A record that replaces `expected` with `new` at `index`.
    ///
    /// The record only borrows `new`: if it is never published, the caller keeps the cell and may
    /// try again with it.
    pub(crate) fn new(index: Index<BUCKETS>, expected: Shared<'_, T>, new: &Owned<T>) -> Self {
        Self {
            index,
            expected: expected.as_raw(),
            new: &**new,
            completed: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Apply this record to its slot. Safe to call any number of times from any number of
    /// threads: exactly one call installs the new cell.
    pub(crate) fn complete(&self, slots: &Slots<T>, guard: &Guard) {
        if self.is_completed() {
            return;
        }

        let slot = slots.ensure(self.index);

        // Failure means another helper already installed the cell.
        let _ = slot.cell.compare_exchange(
            Shared::from(self.expected),
            Shared::from(self.new),
            Ordering::AcqRel,
            Ordering::Acquire,
            guard,
        );

        self.completed.store(true, Ordering::Release);
    }
}

impl<T> Drop for WriteRecord<T> {
    fn drop(&mut self) {
        // An incomplete record never unlinked anything, and its `new` cell is not ours.
        if !*self.completed.get_mut() || self.expected.is_null() {
            return;
        }

        // Safety: Completing the record unlinked `expected` from its slot, and the record is only
        // dropped along with a descriptor that no thread can reach anymore.
        drop(unsafe { Box::from_raw(self.expected as *mut T) });
    }
}

/// An immutable snapshot of the vector: its size, a version bumped by every publish, and at most
/// one write that may not have been applied yet.
pub(crate) struct Descriptor<T> {
    pub(crate) size: usize,
    pub(crate) version: u64,
    pub(crate) pending: Option<WriteRecord<T>>,
}

impl<T> Descriptor<T> {
    pub(crate) fn empty() -> Self {
        Self {
            size: 0,
            version: 0,
            pending: None,
        }
    }

    /// The descriptor that follows this one.
    pub(crate) fn next(&self, size: usize, record: WriteRecord<T>) -> Self {
        Self {
            size,
            version: self.version + 1,
            pending: Some(record),
        }
    }

    /// Finish this descriptor's pending write, if any.
    #[inline]
    pub(crate) fn help(&self, slots: &Slots<T>, guard: &Guard) {
        if let Some(record) = &self.pending {
            record.complete(slots, guard);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Descriptor, Slots, WriteRecord, BUCKETS};
    use crate::buckets::{Buckets, Index};
    use crossbeam_epoch::{self as epoch, Guard, Owned, Shared};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn slots<T>() -> Slots<T> {
        Buckets::new()
    }

    /// Replace the cell at `index` with `value`, handing the new cell to the slot.
    fn install<T>(
        slots: &Slots<T>,
        index: Index<BUCKETS>,
        value: T,
        guard: &Guard,
    ) -> WriteRecord<T> {
        let cell = Owned::new(value);
        let record = WriteRecord::new(index, slots.ensure(index).load(guard), &cell);
        record.complete(slots, guard);
        let _ = cell.into_shared(guard);
        record
    }

    struct Counted(Arc<AtomicUsize>);

    impl Drop for Counted {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn max_buckets() {
        #[cfg(target_pointer_width = "64")]
        assert_eq!(BUCKETS, 32);
        assert!(BUCKETS <= 32);
    }

    #[test]
    fn complete_installs_once() {
        let slots = slots::<u64>();
        let guard = &epoch::pin();
        let index = Index::new(3).unwrap();

        let cell = Owned::new(7);
        let record = WriteRecord::new(index, Shared::null(), &cell);
        assert!(!record.is_completed());

        record.complete(&slots, guard);
        let cell = cell.into_shared(guard);
        assert!(record.is_completed());
        assert_eq!(slots.ensure(index).load(guard), cell);
        assert_eq!(slots.ensure(index).read(guard), 7);

        // Helping again is a no-op.
        record.complete(&slots, guard);
        assert_eq!(slots.ensure(index).load(guard), cell);
    }

    #[test]
    fn stale_record_never_lands() {
        let slots = slots::<u64>();
        let guard = &epoch::pin();
        let index = Index::new(0).unwrap();

        // Built by a helper that observed the empty slot before the first write landed.
        let stale_cell = Owned::new(99);
        let stale = WriteRecord::new(index, Shared::null(), &stale_cell);

        let _first = install(&slots, index, 1, guard);
        let _second = install(&slots, index, 2, guard);

        stale.complete(&slots, guard);
        assert!(stale.is_completed());
        assert_eq!(slots.ensure(index).read(guard), 2);

        // The stale cell never left its owner.
        drop(stale);
        assert_eq!(*stale_cell, 99);
    }

    #[test]
    fn completed_record_frees_replaced_cell() {
        let drops = Arc::new(AtomicUsize::new(0));
        let slots = slots::<Counted>();
        let guard = &epoch::pin();
        let index = Index::new(10).unwrap();

        drop(install(&slots, index, Counted(drops.clone()), guard));
        assert_eq!(drops.load(Ordering::Relaxed), 0);

        // The replaced cell lives as long as the record that unlinked it.
        let second = install(&slots, index, Counted(drops.clone()), guard);
        assert_eq!(drops.load(Ordering::Relaxed), 0);
        drop(second);
        assert_eq!(drops.load(Ordering::Relaxed), 1);

        // An incomplete record owns nothing.
        let cell = Owned::new(Counted(drops.clone()));
        drop(WriteRecord::new(index, slots.ensure(index).load(guard), &cell));
        assert_eq!(drops.load(Ordering::Relaxed), 1);

        drop(cell);
        drop(slots);
        assert_eq!(drops.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn descriptor_versions() {
        let slots = slots::<u64>();
        let guard = &epoch::pin();

        let empty = Descriptor::<u64>::empty();
        empty.help(&slots, guard);
        assert_eq!((empty.size, empty.version), (0, 0));

        let index = Index::new(0).unwrap();
        let cell = Owned::new(5);
        let next = empty.next(1, WriteRecord::new(index, Shared::null(), &cell));
        assert_eq!((next.size, next.version), (1, 1));

        next.help(&slots, guard);
        let _ = cell.into_shared(guard);
        assert!(next.pending.as_ref().unwrap().is_completed());
        assert_eq!(slots.ensure(index).read(guard), 5);
    }

    #[test]
    fn slots_free_their_cells() {
        let drops = Arc::new(AtomicUsize::new(0));
        let slots = slots::<Counted>();

        {
            let guard = &epoch::pin();
            for i in 0..20 {
                install(&slots, Index::new(i).unwrap(), Counted(drops.clone()), guard);
            }
        }

        drop(slots);
        assert_eq!(drops.load(Ordering::Relaxed), 20);
    }
}
