use core::sync::atomic::Ordering;

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};

use crate::buckets::{Buckets, Index};
use crate::descriptor::{Descriptor, Slot, Slots, WriteRecord, BUCKETS};
use crate::Error;

/// A lock-free vector built on a single atomically swapped descriptor.
pub struct Vector<T> {
    /// The current descriptor. Never null.
    descriptor: Atomic<Descriptor<T>>,

    /// Segments of length 8, 16 .. 2^34.
    slots: Slots<T>,
}

impl<T> Vector<T> {
    /// Create an empty vector.
    pub fn new() -> Vector<T> {
        Vector {
            descriptor: Atomic::new(Descriptor::empty()),
            slots: Buckets::new(),
        }
    }

    /// Constructs a new, empty `Vector<T>` with segments covering `capacity` elements.
    pub fn with_capacity(capacity: usize) -> Vector<T> {
        let mut this = Self::new();

        if let Some(highest_index) = capacity.checked_sub(1) {
            this.slots.reserve_mut(Index::new_saturating(highest_index));
        }

        this
    }

    /// Load the current descriptor.
    #[inline]
    fn load<'g>(&self, guard: &'g Guard) -> (Shared<'g, Descriptor<T>>, &'g Descriptor<T>) {
        // The `Acquire` here synchronizes with the `AcqRel` publish in `commit`, so the
        // descriptor, its segment and everything written before it are visible.
        let current = self.descriptor.load(Ordering::Acquire, guard);

        // Safety: The descriptor is never null, and superseded descriptors are only freed through
        // the collector while we are pinned.
        (current, unsafe { current.deref() })
    }

    /// Returns the number of elements in the vector.
    #[inline]
    pub fn size(&self) -> usize {
        let guard = &epoch::pin();
        self.load(guard).1.size
    }

    /// Returns the number of successful mutations so far.
    #[inline]
    pub fn version(&self) -> u64 {
        let guard = &epoch::pin();
        self.load(guard).1.version
    }

    /// Pre-allocate segments for at least `additional` more elements.
    pub fn reserve(&self, additional: usize) {
        let len = self.size();

        if let Some(highest_index) = len.saturating_add(additional).checked_sub(1) {
            self.slots.reserve(Index::new_saturating(highest_index));
        }
    }

    /// Returns the element at `index`.
    ///
    /// This is a plain load: it observes every completed write, and either value of a write
    /// that is still pending on the slot.
    pub fn read(&self, index: usize) -> Result<T, Error>
    where
        T: Clone + Default,
    {
        let guard = &epoch::pin();
        let index = in_bounds(index, self.load(guard).1.size)?;
        Ok(self.slot(index).read(guard))
    }

    #[inline]
    fn slot(&self, index: Index<BUCKETS>) -> &Slot<T> {
        // Every index below a published size already has its segment, so this never allocates
        // outside of `push_back`.
        self.slots.ensure(index)
    }

    /// Returns `true` if the segment with the given number has been allocated.
    #[cfg(test)]
    pub(crate) fn is_allocated(&self, bucket: usize) -> bool {
        self.slots.is_allocated(bucket)
    }
}

impl<T> Vector<T>
where
    T: Send + 'static,
{
    /// Try to replace `current` with its successor of the given size carrying `record`, then
    /// apply the record.
    ///
    /// Returns `false` if another thread published first. The record is then dropped unapplied,
    /// and the cell it would have installed still belongs to the caller.
    fn commit<'g>(
        &self,
        current: Shared<'g, Descriptor<T>>,
        size: usize,
        record: WriteRecord<T>,
        guard: &'g Guard,
    ) -> bool {
        // Safety: `current` was loaded under `guard`.
        let next = Owned::new(unsafe { current.deref() }.next(size, record));

        let Ok(next) = self.descriptor.compare_exchange(
            current,
            next,
            Ordering::AcqRel,
            Ordering::Acquire,
            guard,
        ) else {
            return false;
        };

        // Safety: We just published it, and it cannot be freed while we are pinned.
        unsafe { next.deref() }.help(&self.slots, guard);

        // `current` was helped before `next` was built, so its record is complete and owns the
        // cell it replaced. Both go once no pinned thread can still reach `current`.
        //
        // Safety: `current` is no longer reachable and only the thread that replaced it retires
        // it.
        unsafe { guard.defer_destroy(current) };
        true
    }

    /// Appends an element to the back of the vector.
    pub fn push_back(&self, value: T) {
        let guard = &epoch::pin();
        let value = Owned::new(value);

        loop {
            let (current, descriptor) = self.load(guard);
            descriptor.help(&self.slots, guard);

            let Some(index) = Index::new(descriptor.size) else {
                capacity_overflow();
            };

            // Allocate the segment before publishing the new size.
            let slot = self.slots.ensure(index);
            let record = WriteRecord::new(index, slot.load(guard), &value);

            if self.commit(current, descriptor.size + 1, record, guard) {
                // The slot owns the cell now.
                let _ = value.into_shared(guard);
                return;
            }
        }
    }

    /// Removes the last element and returns it.
    pub fn pop_back(&self) -> Result<T, Error>
    where
        T: Clone + Default,
    {
        let guard = &epoch::pin();
        let cleared = Owned::new(T::default());

        loop {
            let (current, descriptor) = self.load(guard);
            descriptor.help(&self.slots, guard);

            let Some(last) = descriptor.size.checked_sub(1) else {
                return Err(Error::EmptyCollection);
            };

            let index = in_bounds(last, descriptor.size)?;
            let removed = self.slot(index).load(guard);
            let record = WriteRecord::new(index, removed, &cleared);

            if self.commit(current, last, record, guard) {
                let _ = cleared.into_shared(guard);

                // The removed cell now belongs to our descriptor's record, which cannot be freed
                // while we are pinned.
                //
                // Safety: Cells are only freed through the collector.
                return Ok(unsafe { removed.as_ref() }.cloned().unwrap_or_default());
            }
        }
    }

    /// Replaces the element at `index`.
    ///
    /// The replacement goes through the same publish-then-help protocol as `push_back` and
    /// `pop_back`, so it is ordered with them and bumps the version.
    pub fn write(&self, index: usize, value: T) -> Result<(), Error> {
        let guard = &epoch::pin();
        let value = Owned::new(value);

        loop {
            let (current, descriptor) = self.load(guard);
            descriptor.help(&self.slots, guard);

            let index = in_bounds(index, descriptor.size)?;
            let record = WriteRecord::new(index, self.slot(index).load(guard), &value);

            if self.commit(current, descriptor.size, record, guard) {
                let _ = value.into_shared(guard);
                return Ok(());
            }
        }
    }
}

impl<T> Drop for Vector<T> {
    fn drop(&mut self) {
        // Safety: We have unique access, so no other thread can observe the descriptor.
        unsafe {
            let guard = epoch::unprotected();
            let (current, descriptor) = self.load(guard);

            // Apply the last write so its cell is owned by the slot and the cell it replaced by
            // the record. Segments free the cells they hold when `slots` drops.
            descriptor.help(&self.slots, guard);
            drop(current.into_owned());
        }
    }
}

/// Map `index` to its slot if it is below `size`.
#[inline]
fn in_bounds(index: usize, size: usize) -> Result<Index<BUCKETS>, Error> {
    Index::new(index)
        .filter(|_| index < size)
        .ok_or(Error::OutOfRange { index, size })
}

#[cold]
#[inline(never)]
fn capacity_overflow() -> ! {
    panic!("capacity overflow");
}

#[cfg(test)]
mod tests {
    use super::Vector;
    use crate::buckets::FIRST_BUCKET_SIZE;
    use crate::Error;

    #[test]
    fn ninth_push_allocates_second_segment() {
        let vector = Vector::new();
        for i in 0..FIRST_BUCKET_SIZE {
            vector.push_back(i);
        }

        assert!(vector.is_allocated(0));
        assert!(!vector.is_allocated(1));

        vector.push_back(FIRST_BUCKET_SIZE);
        assert!(vector.is_allocated(1));
        assert!(!vector.is_allocated(2));
        assert_eq!(vector.read(FIRST_BUCKET_SIZE), Ok(FIRST_BUCKET_SIZE));
    }

    #[test]
    fn versions_count_mutations() {
        let vector = Vector::new();
        assert_eq!(vector.version(), 0);

        vector.push_back(1_u32);
        vector.push_back(2);
        vector.write(0, 3).unwrap();
        assert_eq!(vector.pop_back(), Ok(2));
        assert_eq!(vector.version(), 4);

        // Failed operations publish nothing.
        assert_eq!(vector.write(5, 0), Err(Error::OutOfRange { index: 5, size: 1 }));
        assert_eq!(vector.pop_back(), Ok(3));
        assert_eq!(vector.pop_back(), Err(Error::EmptyCollection));
        assert_eq!(vector.version(), 5);
    }

    #[test]
    fn popped_slot_reads_default_after_regrowth() {
        let vector = Vector::new();
        vector.push_back(10_u64);
        vector.push_back(20);
        assert_eq!(vector.pop_back(), Ok(20));

        // The cleared slot is reused by the next push.
        vector.push_back(30);
        assert_eq!(vector.read(1), Ok(30));
        assert_eq!(vector.size(), 2);
    }

    #[test]
    fn with_capacity_preallocates() {
        let vector = Vector::<u8>::with_capacity(25);
        assert!(vector.is_allocated(0));
        assert!(vector.is_allocated(1));
        assert!(vector.is_allocated(2));
        assert!(!vector.is_allocated(3));
        assert_eq!(vector.size(), 0);

        vector.reserve(100);
        assert!(vector.is_allocated(3));
    }
}
