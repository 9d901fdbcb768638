use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use sentry::{Hub, SentryFutureExt};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::MemoError;
use super::entry::{CacheEntry, Publisher};
use crate::utils::defer::defer;

/// The memoized function, boxed so the coordinator does not need to be generic over it.
pub(super) type ComputeFn<K, V, E> =
    Arc<dyn Fn(K) -> BoxFuture<'static, Result<V, E>> + Send + Sync>;

/// The private channel on which a single caller waits for its result.
pub(super) type Reply<V, E> = oneshot::Sender<Result<V, MemoError<E>>>;

/// A caller asking for the result of the memoized function applied to `key`.
pub(super) struct Request<K, V, E> {
    pub key: K,
    pub response: Reply<V, E>,
}

/// The monitor task of a [`Memoizer`](crate::Memoizer).
///
/// This is the only place that reads or writes the cache. It never waits on a computation or
/// a delivery itself, both are spawned as separate tasks on `runtime`.
pub(super) struct Coordinator<K, V, E> {
    name: Arc<str>,
    compute: ComputeFn<K, V, E>,
    runtime: Handle,
    cache: HashMap<K, CacheEntry<V, E>>,
}

impl<K, V, E> Coordinator<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(name: Arc<str>, compute: ComputeFn<K, V, E>, runtime: Handle) -> Self {
        Self {
            name,
            compute,
            runtime,
            cache: HashMap::new(),
        }
    }

    /// Serves requests until the memoizer is closed or all of its handles are dropped.
    ///
    /// On close, the queue stops admitting requests, and every request that was already
    /// admitted is still served before this returns.
    pub async fn run(
        mut self,
        mut requests: mpsc::Receiver<Request<K, V, E>>,
        shutdown: CancellationToken,
    ) {
        tracing::debug!(memo = %self.name, "Memo coordinator started");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    requests.close();
                    let mut drained = 0usize;
                    while let Some(request) = requests.recv().await {
                        self.handle(request);
                        drained += 1;
                    }
                    tracing::debug!(memo = %self.name, drained, "Drained memo requests after close");
                    break;
                }
                request = requests.recv() => match request {
                    Some(request) => self.handle(request),
                    None => break,
                },
            }
        }

        tracing::info!(
            memo = %self.name,
            entries = self.cache.len(),
            "Memo coordinator terminated"
        );
    }

    fn handle(&mut self, request: Request<K, V, E>) {
        let Request { key, response } = request;
        let name = self.name.as_ref();

        let entry = match self.cache.get(&key) {
            Some(entry) => {
                let status = if entry.is_ready() { "hit" } else { "pending" };
                metric!(counter("memo.access") += 1, "memo" => name, "status" => status);
                entry.clone()
            }
            None => {
                metric!(counter("memo.access") += 1, "memo" => name, "status" => "miss");
                // This is the first request for this key.
                let (entry, publisher) = CacheEntry::pending();
                self.cache.insert(key.clone(), entry.clone());
                metric!(gauge("memo.entries") = self.cache.len() as u64, "memo" => name);

                self.spawn_computation(key, publisher);
                entry
            }
        };

        self.deliver(entry, response);
    }

    /// Runs the memoized function for `key` and publishes its result.
    ///
    /// This is called exactly once per key, for the lifetime of the coordinator.
    fn spawn_computation(&self, key: K, publisher: Publisher<V, E>) {
        tracing::trace!(memo = %self.name, "Spawning memoized computation");

        let name = Arc::clone(&self.name);
        let compute = Arc::clone(&self.compute);

        let task = async move {
            let start = Instant::now();

            // Fires if the computation panics before publishing, which drops the publisher and
            // turns the entry into `MemoError::Canceled`.
            let canceled = {
                let name = Arc::clone(&name);
                defer(move || {
                    metric!(
                        counter("memo.computation") += 1,
                        "memo" => name.as_ref(),
                        "status" => "canceled",
                    );
                    tracing::error!(memo = %name, "Memoized computation canceled before completing");
                })
            };

            let result = compute(key).await;
            canceled.disarm();

            let status = match result {
                Ok(_) => "ok",
                Err(_) => "error",
            };
            metric!(
                timer("memo.computation.duration") = start.elapsed(),
                "memo" => name.as_ref(),
            );
            metric!(
                counter("memo.computation") += 1,
                "memo" => name.as_ref(),
                "status" => status,
            );

            publisher.publish(result);
        };

        self.runtime
            .spawn(task.bind_hub(Hub::new_from_top(Hub::current())));
    }

    /// Forwards the result of `entry` to a single caller, once it is ready.
    fn deliver(&self, entry: CacheEntry<V, E>, response: Reply<V, E>) {
        // Sending on a oneshot never blocks, so ready entries are answered right away.
        if let Some(result) = entry.peek() {
            send_reply(&self.name, response, result);
            return;
        }

        let name = Arc::clone(&self.name);
        let task = async move {
            let result = entry.wait().await;
            send_reply(&name, response, result);
        };

        self.runtime
            .spawn(task.bind_hub(Hub::new_from_top(Hub::current())));
    }
}

fn send_reply<V, E>(name: &str, response: Reply<V, E>, result: Result<V, MemoError<E>>) {
    if let Err(unsent) = response.send(result) {
        // The caller stopped waiting, this only concerns that one request.
        let outcome = match &unsent {
            Ok(_) => "ok",
            Err(err) => err.metrics_tag(),
        };
        metric!(counter("memo.reply.dropped") += 1, "memo" => name, "result" => outcome);
        tracing::debug!(memo = name, "Caller went away before the result was delivered");
    }
}
