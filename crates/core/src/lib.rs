//! Continuous-batching generation over an opaque autoregressive engine:
//! slot scheduling, adaptive batch throttling, shared-prefix priming,
//! sampling, and stop handling.

pub mod batch;
pub mod config;
pub mod engine;
pub mod generator;
pub mod prefix;
pub mod progress;
pub mod sampling;
pub mod scheduler;
pub mod slot;
pub mod stop;
pub mod throttle;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
