//! Backoff policies shared by the readers, the store adapter, and the
//! producer
//!
//! Each subsystem retries with a different shape: the store adapter waits a
//! fixed second between throttled calls, the pull reader walks a linear
//! table capped at thirty seconds, and the producer draws full-jitter delays
//! under a capped exponential bound around failed publishes.

mod backoff;

pub use backoff::{Backoff, ExponentialBackoff, FixedBackoff, LinearBackoff};
