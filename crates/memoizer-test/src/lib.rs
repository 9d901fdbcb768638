//! Helpers for testing memoizers.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Computations that need to be held in flight should wait on a [`Gate`]. Make sure the
//!    gate is opened before the test ends, otherwise callers of that key wait forever.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `memoizer` crate and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("memoizer=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Counts how often a computation ran, per key.
///
/// Clones share the same counters, so a clone can be moved into the memoized function while
/// the test keeps another one to assert on.
pub struct Invocations<K> {
    calls: Arc<Mutex<HashMap<K, usize>>>,
}

impl<K> Clone for Invocations<K> {
    fn clone(&self) -> Self {
        Self {
            calls: Arc::clone(&self.calls),
        }
    }
}

impl<K> Default for Invocations<K> {
    fn default() -> Self {
        Self {
            calls: Default::default(),
        }
    }
}

impl<K: fmt::Debug> fmt::Debug for Invocations<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Invocations").field(&self.calls).finish()
    }
}

impl<K: Eq + Hash> Invocations<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one invocation for `key`.
    pub fn record(&self, key: K) {
        *self.calls.lock().unwrap().entry(key).or_default() += 1;
    }

    /// Returns how often the computation ran for `key`.
    pub fn count(&self, key: &K) -> usize {
        self.calls.lock().unwrap().get(key).copied().unwrap_or_default()
    }

    /// Returns how often the computation ran, across all keys.
    pub fn total(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    /// Returns the number of distinct keys the computation ran for.
    pub fn distinct_keys(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

/// A gate that holds computations until the test opens it.
///
/// Waiting on an already opened gate returns immediately.
#[derive(Clone, Debug)]
pub struct Gate {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Gate {
    /// Creates a closed gate.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Opens the gate, releasing all current and future waiters.
    pub fn open(&self) {
        self.tx.send_replace(true);
    }

    /// Waits until the gate is opened.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        // The sender is kept alive by `self`, so this can not fail.
        rx.wait_for(|open| *open).await.ok();
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}
