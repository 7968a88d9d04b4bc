//! The storage behind [`Vector`](crate::Vector): a fixed table of lazily-allocated segments whose
//! lengths double, starting at [`FIRST_BUCKET_SIZE`].
//!
//! Segments are published at most once and are never resized or moved, so growing the logical
//! index space never copies existing slots.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;
use core::num::NonZeroUsize;
use core::panic::{RefUnwindSafe, UnwindSafe};
use core::ptr;

use crate::loom::{self, AtomicPtr, Ordering};

/// The length of the first segment. Segment `k` holds `FIRST_BUCKET_SIZE * 2^k` slots.
pub const FIRST_BUCKET_SIZE: usize = 8;

/// The number of doubling segments, of lengths 1, 2 and 4, that would precede the first one if
/// lengths started at one.
const SKIPPED_BUCKETS: usize = FIRST_BUCKET_SIZE.trailing_zeros() as usize;

const _: () = assert!(FIRST_BUCKET_SIZE.is_power_of_two() && SKIPPED_BUCKETS >= 1);

/// A table of up to `BUCKETS` segments, each allocated on first use.
///
/// The `BUCKETS` generic parameter controls the maximum capacity, and the inline size, of the
/// type. See [`buckets_for_index_bits`] for a convenient way to calculate its desired value.
pub struct Buckets<T, const BUCKETS: usize> {
    /// Null, or a `Box<[T]>` of `FIRST_BUCKET_SIZE << k` slots for segment `k`.
    segments: [AtomicPtr<T>; BUCKETS],
}

// Safety: We own the slots and drop them with the table.
unsafe impl<T: Send, const BUCKETS: usize> Send for Buckets<T, BUCKETS> {}

// Safety: Only shared references to slots are handed out. A segment may be allocated by any
// thread, but its slots start out as `T::default()`, so it doesn't matter which thread that was.
unsafe impl<T: Sync, const BUCKETS: usize> Sync for Buckets<T, BUCKETS> {}

impl<T: UnwindSafe, const BUCKETS: usize> UnwindSafe for Buckets<T, BUCKETS> {}
impl<T: RefUnwindSafe, const BUCKETS: usize> RefUnwindSafe for Buckets<T, BUCKETS> {}

impl<T, const BUCKETS: usize> Buckets<T, BUCKETS> {
    /// Construct a new `Buckets` with no segments allocated.
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self {
            segments: [const { AtomicPtr::new(ptr::null_mut()) }; BUCKETS],
        }
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self {
            segments: core::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
        }
    }

    #[inline]
    fn segment(&self, bucket: usize) -> &AtomicPtr<T> {
        debug_assert!(bucket < BUCKETS);

        // Safety: Every `Index<BUCKETS>` maps to a segment below `BUCKETS`.
        unsafe { self.segments.get_unchecked(bucket) }
    }

    /// Returns `true` if the segment with the given number has been published.
    ///
    /// # Examples
    ///
    /// ```
    /// # use lfvec::buckets::{self, Buckets};
    /// let buckets = <Buckets<u8, 4>>::new();
    /// assert!(!buckets.is_allocated(1));
    ///
    /// buckets.ensure(buckets::Index::new(8).unwrap());
    /// assert!(!buckets.is_allocated(0));
    /// assert!(buckets.is_allocated(1));
    /// ```
    pub fn is_allocated(&self, bucket: usize) -> bool {
        match self.segments.get(bucket) {
            // We don't access the segment, so `Relaxed` is enough.
            Some(segment) => !segment.load(Ordering::Relaxed).is_null(),
            None => false,
        }
    }

    /// Retrieve the slot at the specified index, or `None` if its segment has not been allocated
    /// yet.
    ///
    /// # Examples
    ///
    /// ```
    /// # use lfvec::buckets::{self, Buckets};
    /// let buckets = <Buckets<u8, 5>>::new();
    /// let index = buckets::Index::new(20).unwrap();
    ///
    /// assert_eq!(buckets.get(index), None);
    /// buckets.ensure(index);
    /// assert_eq!(buckets.get(index), Some(&0));
    /// ```
    pub fn get(&self, index: Index<BUCKETS>) -> Option<&T> {
        // `Acquire` pairs with the `Release` publish in `allocate`, making the slots visible.
        let segment = self.segment(index.bucket()).load(Ordering::Acquire);
        if segment.is_null() {
            return None;
        }

        // Safety: The offset is below the segment length, and the segment is never freed while
        // we are borrowed.
        Some(unsafe { &*segment.add(index.offset()) })
    }

    /// Retrieve the slot at the specified index, allocating and publishing its segment first if
    /// no thread has done so yet.
    ///
    /// Only the segment holding `index` is allocated. When two threads race to allocate it,
    /// exactly one allocation is published and the other is freed before returning.
    ///
    /// # Examples
    ///
    /// ```
    /// # use lfvec::buckets::{self, Buckets};
    /// let buckets = <Buckets<u8, 5>>::new();
    ///
    /// let index = buckets::Index::new(48).unwrap();
    /// assert_eq!(*buckets.ensure(index), 0);
    /// assert_eq!(buckets.get(buckets::Index::new(0).unwrap()), None);
    /// ```
    pub fn ensure(&self, index: Index<BUCKETS>) -> &T
    where
        T: Default,
    {
        let bucket = index.bucket();

        let mut segment = self.segment(bucket).load(Ordering::Acquire);
        if segment.is_null() {
            segment = self.allocate(bucket);
        }

        // Safety: As in `get`, and `allocate` never returns null.
        unsafe { &*segment.add(index.offset()) }
    }

    /// Allocate every segment up to and including the one holding `index`.
    ///
    /// After calling this method, [`ensure`](Self::ensure) is guaranteed not to allocate for any
    /// index up to `index`.
    ///
    /// # Examples
    ///
    /// ```
    /// # use lfvec::buckets::{self, Buckets};
    /// let buckets = <Buckets<u8, 5>>::new();
    ///
    /// buckets.reserve(buckets::Index::new(20).unwrap());
    /// assert!(buckets.is_allocated(0));
    /// assert!(buckets.is_allocated(1));
    /// assert!(!buckets.is_allocated(2));
    /// ```
    pub fn reserve(&self, index: Index<BUCKETS>)
    where
        T: Default,
    {
        // Walk backwards so a concurrent `reserve` for a larger index usually finds our segments
        // already published and stops early.
        for bucket in (0..=index.bucket()).rev() {
            if self.is_allocated(bucket) {
                // `ensure` may have skipped ahead, so an earlier segment can still be missing.
                continue;
            }

            self.allocate(bucket);
        }
    }

    /// Like [`reserve`](Self::reserve), but takes a unique reference and so avoids atomics.
    pub fn reserve_mut(&mut self, index: Index<BUCKETS>)
    where
        T: Default,
    {
        for (bucket, segment) in self.segments[..=index.bucket()].iter_mut().enumerate() {
            loom::with_mut(segment, |segment| {
                if segment.is_null() {
                    *segment = new_segment::<T>(bucket_len(bucket));
                }
            });
        }
    }

    /// Race to publish segment `bucket`, returning whichever allocation won.
    #[cold]
    #[inline(never)]
    fn allocate(&self, bucket: usize) -> *mut T
    where
        T: Default,
    {
        let len = bucket_len(bucket);
        let new = new_segment::<T>(len);

        match self.segment(bucket).compare_exchange(
            ptr::null_mut(),
            new,
            // `Release` publishes the default-initialized slots to threads that load the pointer
            // with `Acquire`.
            Ordering::Release,
            // `Acquire` lets us use the winner's slots.
            Ordering::Acquire,
        ) {
            Ok(_) => {
                log::trace!("allocated segment {bucket} ({len} slots)");
                new
            }
            Err(winner) => {
                log::trace!("lost allocation race for segment {bucket}");

                // Safety: The allocation was never published.
                drop(unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(new, len)) });
                winner
            }
        }
    }
}

impl<T, const BUCKETS: usize> Drop for Buckets<T, BUCKETS> {
    fn drop(&mut self) {
        for (bucket, segment) in self.segments.iter_mut().enumerate() {
            let segment = loom::with_mut(segment, |segment| *segment);
            if segment.is_null() {
                continue;
            }

            let len = bucket_len(bucket);

            // Safety: Every published segment came from `new_segment` with this length.
            drop(unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(segment, len)) });
        }
    }
}

impl<T, const BUCKETS: usize> Default for Buckets<T, BUCKETS> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const BUCKETS: usize> fmt::Debug for Buckets<T, BUCKETS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries((0..BUCKETS).filter(|&bucket| self.is_allocated(bucket)))
            .finish()
    }
}

/// The number of slots in segment `bucket`.
#[inline]
const fn bucket_len(bucket: usize) -> usize {
    FIRST_BUCKET_SIZE << bucket
}

/// Allocate a segment of `len` default slots and leak it.
///
/// Aborts through the global allocation error handler if memory is exhausted.
fn new_segment<T: Default>(len: usize) -> *mut T {
    let mut slots = Vec::with_capacity(len);
    slots.resize_with(len, T::default);
    Box::into_raw(slots.into_boxed_slice()).cast::<T>()
}

/// A valid logical index into [`Buckets`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Index<const BUCKETS: usize> {
    /// The logical index plus `FIRST_BUCKET_SIZE`.
    ///
    /// Invariant: `FIRST_BUCKET_SIZE ≤ pos < ENTRIES + FIRST_BUCKET_SIZE`.
    pos: NonZeroUsize,
}

impl<const BUCKETS: usize> Index<BUCKETS> {
    /// The number of addressable slots across all `BUCKETS` segments,
    /// `FIRST_BUCKET_SIZE * (2 ^ BUCKETS - 1)`.
    pub const ENTRIES: usize = {
        assert!(
            BUCKETS <= buckets_for_index_bits(usize::BITS),
            "too many segments for the index space"
        );

        // `2 ^ (BUCKETS + SKIPPED_BUCKETS) - 1` without overflowing when it fills a `usize`.
        let all_ones = usize::MAX >> (usize::BITS as usize - BUCKETS - SKIPPED_BUCKETS);
        all_ones - (FIRST_BUCKET_SIZE - 1)
    };

    /// Construct a new `Index`.
    ///
    /// Returns `None` if the index is beyond the last segment.
    pub const fn new(i: usize) -> Option<Self> {
        if i < Self::ENTRIES {
            // Safety: What we just checked.
            Some(unsafe { Self::new_unchecked(i) })
        } else {
            None
        }
    }

    /// Construct a new `Index` without bounds-checking.
    ///
    /// # Safety
    ///
    /// `Index::new(i)` must return `Some`.
    pub const unsafe fn new_unchecked(i: usize) -> Self {
        debug_assert!(i < Self::ENTRIES);

        // Safety: `i < ENTRIES` keeps the sum in range, and it is at least `FIRST_BUCKET_SIZE`.
        let pos = unsafe { NonZeroUsize::new_unchecked(i + FIRST_BUCKET_SIZE) };
        Self { pos }
    }

    /// Construct a new `Index`, returning the last index if `i` is out-of-bounds.
    pub fn new_saturating(i: usize) -> Self {
        // Safety: `ENTRIES - 1` is the last valid index.
        unsafe { Self::new_unchecked(i.min(Self::ENTRIES - 1)) }
    }

    /// Get the index passed into [`Index::new`].
    pub const fn get(self) -> usize {
        self.pos.get() - FIRST_BUCKET_SIZE
    }

    /// The position of the highest set bit of `i + FIRST_BUCKET_SIZE`.
    #[inline]
    fn hi(self) -> usize {
        self.pos.ilog2() as usize
    }

    /// The segment this index maps to.
    ///
    /// ```
    /// # use lfvec::buckets::Index;
    /// assert_eq!(<Index<32>>::new(7).unwrap().bucket(), 0);
    /// assert_eq!(<Index<32>>::new(8).unwrap().bucket(), 1);
    /// assert_eq!(<Index<32>>::new(24).unwrap().bucket(), 2);
    /// ```
    #[inline]
    pub fn bucket(self) -> usize {
        // The first `k` segments hold `FIRST_BUCKET_SIZE * (2 ^ k - 1)` slots, so index `i` lands
        // in segment `k` exactly when `2 ^ (k + SKIPPED_BUCKETS) ≤ pos < 2 ^ (k + SKIPPED_BUCKETS + 1)`.
        self.hi() - SKIPPED_BUCKETS
    }

    /// The offset of this index within its segment.
    ///
    /// ```
    /// # use lfvec::buckets::Index;
    /// assert_eq!(<Index<32>>::new(7).unwrap().offset(), 7);
    /// assert_eq!(<Index<32>>::new(8).unwrap().offset(), 0);
    /// assert_eq!(<Index<32>>::new(30).unwrap().offset(), 6);
    /// ```
    #[inline]
    pub fn offset(self) -> usize {
        self.pos.get() ^ (1 << self.hi())
    }

    /// The number of slots in this index's segment.
    #[inline]
    pub fn bucket_len(self) -> usize {
        bucket_len(self.bucket())
    }
}

impl<const BUCKETS: usize> fmt::Debug for Index<BUCKETS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.get(), f)
    }
}

/// Calculate the largest value of the `BUCKETS` generic parameter such that every slot is given
/// an index less than `2 ^ bits`.
///
/// # Panics
///
/// `bits` may not exceed `usize::BITS`.
pub const fn buckets_for_index_bits(bits: u32) -> usize {
    assert!(bits <= usize::BITS);

    // ENTRIES = 2 ^ (BUCKETS + SKIPPED_BUCKETS) - 2 ^ SKIPPED_BUCKETS, which stays below
    // 2 ^ bits as long as BUCKETS + SKIPPED_BUCKETS ≤ bits.
    (bits as usize).saturating_sub(SKIPPED_BUCKETS)
}
