/// Errors surfaced by [`Vector`](crate::Vector) operations.
///
/// Contention is never an error: compare-and-swap failures are retried internally. Both
/// variants describe the vector's state at the moment the operation was linearized, so under
/// concurrent use they are benign and a caller may simply try again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// `pop_back` was called on an empty vector.
    #[error("cannot pop from an empty vector")]
    EmptyCollection,

    /// An index at or beyond the current size was passed to `read` or `write`.
    #[error("index {index} is out of range for a vector of size {size}")]
    OutOfRange { index: usize, size: usize },
}

#[cfg(test)]
mod tests {
    use super::Error;
    use alloc::string::ToString;

    #[test]
    fn display() {
        assert_eq!(
            Error::EmptyCollection.to_string(),
            "cannot pop from an empty vector"
        );
        assert_eq!(
            Error::OutOfRange { index: 3, size: 2 }.to_string(),
            "index 3 is out of range for a vector of size 2"
        );
    }
}
