//! Shared utilities: the bounded worker pool and unix-time helpers.

#![warn(missing_docs)]

/// Bounded-concurrency task launcher with cancellation.
pub mod pool;

/// Unix timestamp helpers.
pub mod unix_time;

pub use pool::{Pool, PoolError, PoolStats};
pub use unix_time::unix_now_ms;
