//! Shared test utilities for genpool-core.
//!
//! This module provides a scriptable mock engine so scheduler, throttle,
//! and generator behavior can be exercised without a real model.

mod mock_engine;

pub use mock_engine::MockEngine;
