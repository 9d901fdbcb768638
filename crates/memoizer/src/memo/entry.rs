use futures::FutureExt;
use futures::future::Shared;
use tokio::sync::oneshot;

use super::MemoError;

/// The readiness signal of an entry.
///
/// The sending half is owned by the one computation task. Any number of clones of the shared
/// receiver can wait on it, and once it resolved every clone, including ones created later,
/// sees the same value.
type Readiness<V, E> = Shared<oneshot::Receiver<Result<V, E>>>;

/// The (possibly in-flight) result for one key.
///
/// The value is written exactly once, by sending it through the readiness channel, so it is
/// impossible to observe the value before the entry became ready.
pub(super) struct CacheEntry<V, E> {
    ready: Readiness<V, E>,
}

impl<V, E> Clone for CacheEntry<V, E> {
    fn clone(&self) -> Self {
        Self {
            ready: self.ready.clone(),
        }
    }
}

/// The write-once half of a [`CacheEntry`], handed to the computation task.
pub(super) struct Publisher<V, E>(oneshot::Sender<Result<V, E>>);

impl<V, E> Publisher<V, E> {
    /// Stores the result and fires the readiness signal.
    pub fn publish(self, result: Result<V, E>) {
        // Fails only if the entry itself is gone, in which case nobody can wait on it anymore.
        self.0.send(result).ok();
    }
}

impl<V, E> CacheEntry<V, E>
where
    V: Clone,
    E: Clone,
{
    /// Creates a new entry that is not ready yet, along with the handle that completes it.
    pub fn pending() -> (Self, Publisher<V, E>) {
        let (tx, rx) = oneshot::channel();
        let entry = Self { ready: rx.shared() };
        (entry, Publisher(tx))
    }

    /// Returns the result if the entry is ready, without waiting.
    pub fn peek(&self) -> Option<Result<V, MemoError<E>>> {
        self.ready.peek().cloned().map(into_memo_result)
    }

    /// Whether the readiness signal has already fired.
    pub fn is_ready(&self) -> bool {
        self.ready.peek().is_some()
    }

    /// Waits for the readiness signal and returns the result.
    pub async fn wait(self) -> Result<V, MemoError<E>> {
        into_memo_result(self.ready.await)
    }
}

fn into_memo_result<V, E>(
    result: Result<Result<V, E>, oneshot::error::RecvError>,
) -> Result<V, MemoError<E>> {
    match result {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(MemoError::Computation(err)),
        // The publisher was dropped without storing anything.
        Err(_) => Err(MemoError::Canceled),
    }
}
