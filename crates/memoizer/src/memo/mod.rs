use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use futures::FutureExt;
use sentry::{Hub, SentryFutureExt};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::MemoConfig;

mod coordinator;
mod entry;
mod error;

#[cfg(test)]
mod tests;

use coordinator::{ComputeFn, Coordinator, Request};

pub use error::MemoError;

/// A concurrent, non-blocking memoization of an async function.
///
/// The function is invoked at most once per distinct key for the lifetime of the memoizer. All
/// callers asking for a key, whether they arrive before, during or after its computation,
/// receive a clone of that single result. Errors are results too: a failed computation is
/// cached and never retried.
///
/// Cloning a `Memoizer` is cheap, all clones share the same cache. The cache lives until
/// [`close`](Self::close) is called and the last in-flight request finished, or until the last
/// clone is dropped.
///
/// ```ignore
/// let memo = Memoizer::new(MemoConfig::named("pages"), |url: String| async move {
///     fetch(&url).await.map_err(|e| e.to_string())
/// });
/// let body = memo.get("https://example.com".into()).await?;
/// ```
pub struct Memoizer<K, V, E> {
    name: Arc<str>,
    requests: mpsc::Sender<Request<K, V, E>>,
    shutdown: CancellationToken,
}

impl<K, V, E> Clone for Memoizer<K, V, E> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            requests: self.requests.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<K, V, E> fmt::Debug for Memoizer<K, V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memoizer")
            .field("name", &self.name)
            .field("queue_capacity", &self.requests.capacity())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<K, V, E> Memoizer<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Creates a memoization of `f` on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime. Use [`with_runtime`](Self::with_runtime)
    /// in that case.
    pub fn new<F, Fut>(config: MemoConfig, f: F) -> Self
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        Self::with_runtime(config, Handle::current(), f)
    }

    /// Creates a memoization of `f` whose coordinator, computations and deliveries all run on
    /// `runtime`.
    pub fn with_runtime<F, Fut>(config: MemoConfig, runtime: Handle, f: F) -> Self
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let MemoConfig {
            name,
            max_queue_size,
        } = config;
        let name: Arc<str> = name.into();

        let compute: ComputeFn<K, V, E> = Arc::new(move |key: K| f(key).boxed());
        let (requests, requests_rx) = mpsc::channel(max_queue_size.max(1));
        let shutdown = CancellationToken::new();

        let coordinator = Coordinator::new(Arc::clone(&name), compute, runtime.clone());
        runtime.spawn(
            coordinator
                .run(requests_rx, shutdown.clone())
                .bind_hub(Hub::new_from_top(Hub::current())),
        );

        Self {
            name,
            requests,
            shutdown,
        }
    }

    /// Returns the result of the memoized function for `key`.
    ///
    /// The first request for a key starts the computation, every other request waits for that
    /// same computation. Fails with [`MemoError::Closed`] once [`close`](Self::close) was called.
    pub async fn get(&self, key: K) -> Result<V, MemoError<E>> {
        if self.is_closed() {
            return Err(self.rejected());
        }

        let (response, response_rx) = oneshot::channel();
        self.requests
            .send(Request { key, response })
            .await
            .map_err(|_| self.rejected())?;

        response_rx.await.unwrap_or(Err(MemoError::Canceled))
    }

    /// Returns the result of the memoized function for `key`, blocking the current thread.
    ///
    /// This is [`get`](Self::get) for callers on plain threads outside of the runtime.
    ///
    /// # Panics
    ///
    /// Panics when called from within an asynchronous execution context.
    pub fn blocking_get(&self, key: K) -> Result<V, MemoError<E>> {
        if self.is_closed() {
            return Err(self.rejected());
        }

        let (response, response_rx) = oneshot::channel();
        self.requests
            .blocking_send(Request { key, response })
            .map_err(|_| self.rejected())?;

        response_rx.blocking_recv().unwrap_or(Err(MemoError::Canceled))
    }
}

impl<K, V, E> Memoizer<K, V, E> {
    /// Stops admitting new requests.
    ///
    /// Requests that were already admitted, as well as running computations, still complete.
    /// Any later call to [`get`](Memoizer::get) fails with [`MemoError::Closed`]. Calling this
    /// more than once, or from several clones, has no further effect.
    pub fn close(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::debug!(memo = %self.name, "Closing memoizer");
        }
        self.shutdown.cancel();
    }

    /// Whether [`close`](Self::close) has been called on this memoizer or one of its clones.
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// The configured name of this memoizer.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn rejected<T>(&self) -> MemoError<T> {
        metric!(counter("memo.rejected") += 1, "memo" => self.name.as_ref());
        tracing::trace!(memo = %self.name, "Rejected request to closed memoizer");
        MemoError::Closed
    }
}
