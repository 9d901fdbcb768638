//! A concurrent, non-blocking memoizer for keyed async computations.
//!
//! A [`Memoizer`] wraps a function `K -> Future<Output = Result<V, E>>` and makes sure the
//! function runs at most once per distinct key, no matter how many callers ask for that key
//! concurrently or later on. Every caller receives a clone of the single result, including
//! errors, which are cached just like values.
//!
//! The cache itself is owned by a single coordinator task. Callers never touch it, they send
//! requests over a channel and wait on a private reply channel. Computations and deliveries run
//! as independent tasks, so a slow key never holds up requests for other keys.

#[macro_use]
pub mod metrics;

pub mod config;
pub mod logging;
mod memo;
mod utils;

pub use memo::{MemoError, Memoizer};
