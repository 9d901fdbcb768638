use thiserror::Error;

/// An error returned from [`Memoizer::get`](crate::Memoizer::get).
///
/// Only [`Computation`](Self::Computation) comes from the memoized function itself. It is
/// cached like any successful value and handed out verbatim to every caller of that key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoError<E> {
    /// The memoized function returned an error for this key.
    #[error("computation failed: {0}")]
    Computation(E),
    /// The memoizer was closed before the request was admitted.
    #[error("memoizer is closed")]
    Closed,
    /// The computation for this key went away without producing a value, most likely because
    /// it panicked or its runtime shut down.
    ///
    /// Like computation errors, this outcome is permanent for the key.
    #[error("computation was canceled")]
    Canceled,
}

impl<E> MemoError<E> {
    /// Returns the error of the memoized function, if this is one.
    pub fn into_computation_error(self) -> Option<E> {
        match self {
            Self::Computation(err) => Some(err),
            _ => None,
        }
    }

    /// A short name suitable for metric tags.
    pub(crate) fn metrics_tag(&self) -> &'static str {
        match self {
            Self::Computation(_) => "error",
            Self::Closed => "closed",
            Self::Canceled => "canceled",
        }
    }
}
