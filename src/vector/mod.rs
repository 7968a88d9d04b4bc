//! A lock-free, growable vector.
//!
//! See [the crate documentation](crate) and [`Vector`] for details.

use core::fmt;
use core::iter::FusedIterator;

use alloc::vec::Vec;

use crate::Error;

mod raw;

/// Creates a [`Vector`] containing the given elements.
///
/// `vector!` allows `Vector`s to be defined with the same syntax as array expressions.
/// There are two forms of this macro:
///
/// - Create a [`Vector`] containing a given list of elements:
///
/// ```
/// let vector = lfvec::vector![1, 2, 3];
/// assert_eq!(vector.read(0), Ok(1));
/// assert_eq!(vector.read(1), Ok(2));
/// assert_eq!(vector.read(2), Ok(3));
/// ```
///
/// - Create a [`Vector`] from a given element and size:
///
/// ```
/// let vector = lfvec::vector![1; 3];
/// assert_eq!(vector, [1, 1, 1]);
/// ```
#[macro_export]
macro_rules! vector {
    () => {
        $crate::Vector::new()
    };
    ($elem:expr; $n:expr) => {{
        let n = $n;
        let mut vector = $crate::Vector::with_capacity(n);
        let iter = ::core::iter::Iterator::take(::core::iter::repeat($elem), n);
        ::core::iter::Extend::extend(&mut vector, iter);
        vector
    }};
    ($($x:expr),+ $(,)?) => (
        <$crate::Vector<_> as ::core::iter::FromIterator<_>>::from_iter([$($x),+])
    );
}

/// A lock-free, growable vector.
///
/// Every mutation, `push_back`, `pop_back` and `write`, publishes a new descriptor with a single
/// compare-and-swap and is then applied by the calling thread or by whichever thread touches the
/// vector next. A stalled thread therefore never blocks the others. `read` and `size` are plain
/// loads.
///
/// Elements live in segments of 8, 16, 32, ... slots that are allocated on demand and never
/// moved, so growing the vector never copies.
///
/// See [the crate documentation](crate) for details.
///
/// # Notes
///
/// The segment table is stored inline, meaning that the `Vector<T>` type is quite large on the
/// stack. It is expected that you store it behind an [`Arc`](alloc::sync::Arc) or similar.
pub struct Vector<T> {
    raw: raw::Vector<T>,
}

impl<T> Default for Vector<T> {
    fn default() -> Vector<T> {
        Vector::new()
    }
}

impl<T> Vector<T> {
    /// Constructs a new, empty `Vector<T>`.
    ///
    /// # Examples
    ///
    /// ```
    /// let vector: lfvec::Vector<i32> = lfvec::Vector::new();
    /// assert_eq!(vector.size(), 0);
    /// ```
    #[inline]
    pub fn new() -> Vector<T> {
        Vector {
            raw: raw::Vector::new(),
        }
    }

    /// Constructs a new, empty `Vector<T>` with the specified capacity.
    ///
    /// The vector will be able to hold at least `capacity` elements without allocating
    /// segments.
    ///
    /// # Examples
    ///
    /// ```
    /// let vector = lfvec::Vector::with_capacity(10);
    ///
    /// for i in 0..10 {
    ///     // Will not allocate a segment.
    ///     vector.push_back(i);
    /// }
    /// ```
    #[inline]
    pub fn with_capacity(capacity: usize) -> Vector<T> {
        Vector {
            raw: raw::Vector::with_capacity(capacity),
        }
    }

    /// Allocates segments for at least `additional` more elements. Existing elements are never
    /// moved.
    ///
    /// Does nothing if capacity is already sufficient.
    ///
    /// # Examples
    ///
    /// ```
    /// let vector = lfvec::Vector::new();
    /// vector.reserve(10);
    ///
    /// for i in 0..10 {
    ///     // Will not allocate a segment.
    ///     vector.push_back(i);
    /// }
    /// ```
    pub fn reserve(&self, additional: usize) {
        self.raw.reserve(additional)
    }

    /// Returns the number of elements in the vector.
    ///
    /// # Examples
    ///
    /// ```
    /// let vector = lfvec::Vector::new();
    /// assert_eq!(vector.size(), 0);
    /// vector.push_back(1);
    /// vector.push_back(2);
    /// assert_eq!(vector.size(), 2);
    /// ```
    #[inline]
    pub fn size(&self) -> usize {
        self.raw.size()
    }

    /// Returns `true` if the vector contains no elements.
    ///
    /// # Examples
    ///
    /// ```
    /// let vector = lfvec::Vector::new();
    /// assert!(vector.is_empty());
    ///
    /// vector.push_back(1);
    /// assert!(!vector.is_empty());
    /// ```
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Returns the number of successful `push_back`, `pop_back` and `write` calls made so far.
    ///
    /// # Examples
    ///
    /// ```
    /// let vector = lfvec::Vector::new();
    /// vector.push_back(1);
    /// vector.write(0, 2).unwrap();
    /// assert!(vector.read(1).is_err());
    /// assert_eq!(vector.version(), 2);
    /// ```
    #[inline]
    pub fn version(&self) -> u64 {
        self.raw.version()
    }

    /// Returns a copy of the element at the given index.
    ///
    /// A read concurrent with a write to the same slot that has been published but not yet
    /// applied may return either the old or the new value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if `index` is not below [`size`](Vector::size).
    ///
    /// # Examples
    ///
    /// ```
    /// use lfvec::Error;
    ///
    /// let vector = lfvec::vector![10, 40, 30];
    /// assert_eq!(vector.read(1), Ok(40));
    /// assert_eq!(vector.read(3), Err(Error::OutOfRange { index: 3, size: 3 }));
    /// ```
    #[inline]
    pub fn read(&self, index: usize) -> Result<T, Error>
    where
        T: Clone + Default,
    {
        self.raw.read(index)
    }

    /// Returns an iterator over copies of the elements.
    ///
    /// The iterator covers the indices below the size observed when it was created, and stops
    /// early if the vector shrinks below the next index.
    ///
    /// # Examples
    ///
    /// ```
    /// let vector = lfvec::vector![1, 2, 4];
    /// let mut iterator = vector.iter();
    ///
    /// assert_eq!(iterator.next(), Some(1));
    /// assert_eq!(iterator.next(), Some(2));
    /// assert_eq!(iterator.next(), Some(4));
    /// assert_eq!(iterator.next(), None);
    /// ```
    #[inline]
    pub fn iter(&self) -> Iter<'_, T>
    where
        T: Clone + Default,
    {
        Iter {
            vector: self,
            index: 0,
            end: self.size(),
        }
    }

    /// Copies the elements into a `Vec`.
    ///
    /// # Examples
    ///
    /// ```
    /// let vector = lfvec::vector![1, 2, 3];
    /// assert_eq!(vector.to_vec(), vec![1, 2, 3]);
    /// ```
    pub fn to_vec(&self) -> Vec<T>
    where
        T: Clone + Default,
    {
        self.iter().collect()
    }
}

impl<T> Vector<T>
where
    T: Send + 'static,
{
    /// Appends an element to the back of the vector.
    ///
    /// # Panics
    ///
    /// Panics if the vector is full: every one of its 32 segments is in use.
    ///
    /// # Examples
    ///
    /// ```
    /// let vector = lfvec::vector![1, 2];
    /// vector.push_back(3);
    /// assert_eq!(vector, [1, 2, 3]);
    /// ```
    #[inline]
    pub fn push_back(&self, value: T) {
        self.raw.push_back(value)
    }

    /// Removes the last element from the vector and returns it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyCollection`] if the vector is empty.
    ///
    /// # Examples
    ///
    /// ```
    /// use lfvec::Error;
    ///
    /// let vector = lfvec::vector![1, 2];
    /// assert_eq!(vector.pop_back(), Ok(2));
    /// assert_eq!(vector.pop_back(), Ok(1));
    /// assert_eq!(vector.pop_back(), Err(Error::EmptyCollection));
    /// ```
    #[inline]
    pub fn pop_back(&self) -> Result<T, Error>
    where
        T: Clone + Default,
    {
        self.raw.pop_back()
    }

    /// Replaces the element at the given index.
    ///
    /// Writes are ordered with `push_back` and `pop_back`: a write to the last slot racing a
    /// `pop_back` either lands before the pop, and is what the pop returns, or fails with
    /// [`Error::OutOfRange`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if `index` is not below [`size`](Vector::size).
    ///
    /// # Examples
    ///
    /// ```
    /// let vector = lfvec::vector![1, 2, 3];
    /// vector.write(1, 20).unwrap();
    /// assert_eq!(vector, [1, 20, 3]);
    /// assert!(vector.write(3, 4).is_err());
    /// ```
    #[inline]
    pub fn write(&self, index: usize, value: T) -> Result<(), Error> {
        self.raw.write(index, value)
    }
}

impl<'a, T> IntoIterator for &'a Vector<T>
where
    T: Clone + Default,
{
    type Item = T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// An iterator over copies of the elements of a [`Vector<T>`].
///
/// See [`Vector::iter`] for details.
pub struct Iter<'a, T> {
    vector: &'a Vector<T>,
    index: usize,
    end: usize,
}

impl<T> Clone for Iter<'_, T> {
    fn clone(&self) -> Self {
        Iter {
            vector: self.vector,
            index: self.index,
            end: self.end,
        }
    }
}

impl<T> Iterator for Iter<'_, T>
where
    T: Clone + Default,
{
    type Item = T;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.end {
            return None;
        }

        match self.vector.read(self.index) {
            Ok(value) => {
                self.index += 1;
                Some(value)
            }
            // The vector shrank underneath us.
            Err(_) => {
                self.index = self.end;
                None
            }
        }
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.end - self.index))
    }
}

impl<T> FusedIterator for Iter<'_, T> where T: Clone + Default {}

impl<T: Clone + Default + fmt::Debug> fmt::Debug for Iter<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Iter")
            .field(&self.clone().collect::<Vec<_>>())
            .finish()
    }
}

impl<T> FromIterator<T> for Vector<T>
where
    T: Send + 'static,
{
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let iter = iter.into_iter();

        let (lower, _) = iter.size_hint();
        let vector = Vector::with_capacity(lower);

        for value in iter {
            vector.push_back(value);
        }

        vector
    }
}

impl<T> Extend<T> for Vector<T>
where
    T: Send + 'static,
{
    #[inline]
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        let iter = iter.into_iter();

        let (lower, _) = iter.size_hint();
        self.reserve(lower);

        for value in iter {
            self.push_back(value);
        }
    }
}

impl<T> Clone for Vector<T>
where
    T: Clone + Default + Send + 'static,
{
    fn clone(&self) -> Vector<T> {
        self.iter().collect()
    }
}

impl<T: Clone + Default + fmt::Debug> fmt::Debug for Vector<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<T> PartialEq for Vector<T>
where
    T: Clone + Default + PartialEq,
{
    fn eq(&self, other: &Self) -> bool {
        self.size() == other.size() && self.iter().eq(other.iter())
    }
}

impl<T> PartialEq<[T]> for Vector<T>
where
    T: Clone + Default + PartialEq,
{
    fn eq(&self, other: &[T]) -> bool {
        self.size() == other.len() && self.iter().eq(other.iter().cloned())
    }
}

impl<T, const N: usize> PartialEq<[T; N]> for Vector<T>
where
    T: Clone + Default + PartialEq,
{
    fn eq(&self, other: &[T; N]) -> bool {
        *self == other[..]
    }
}

impl<T> PartialEq<Vec<T>> for Vector<T>
where
    T: Clone + Default + PartialEq,
{
    fn eq(&self, other: &Vec<T>) -> bool {
        *self == other[..]
    }
}

impl<T: Clone + Default + Eq> Eq for Vector<T> {}
