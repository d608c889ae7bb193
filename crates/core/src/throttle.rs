//! Adaptive decode throttling: carves a step batch into capacity-sized
//! windows and halves the capacity when the engine signals exhaustion.

use std::ops::Range;

use tracing::warn;

use crate::batch::StepBatch;
use crate::config::Verbosity;
use crate::engine::{DecodeStatus, EngineError, InferenceEngine};

/// Submits step batches through the engine in windows bounded by the
/// current sub-batch capacity.
///
/// Capacity starts at the configured limit afresh for every batch and only
/// shrinks within one: a transient exhaustion halves it (floor one token)
/// and the same unconsumed range is retried, so no token is skipped or
/// duplicated. The event counter spans the throttle's lifetime, one
/// generation call.
#[derive(Debug)]
pub struct BatchThrottle {
    capacity_limit: usize,
    events: u64,
    verbosity: Verbosity,
}

impl BatchThrottle {
    pub fn new(capacity_limit: usize, verbosity: Verbosity) -> Self {
        Self {
            capacity_limit: capacity_limit.max(1),
            events: 0,
            verbosity,
        }
    }

    /// Throttle events recorded so far.
    pub fn events(&self) -> u64 {
        self.events
    }

    /// Starting capacity applied to each submitted batch.
    pub fn capacity_limit(&self) -> usize {
        self.capacity_limit
    }

    /// Push `batch` through `engine`, invoking `on_window` with the row
    /// range of every accepted window, in order.
    ///
    /// Exhaustion at the single-token floor and any engine failure abort
    /// the remainder of the batch.
    pub fn submit<E, F>(
        &mut self,
        engine: &mut E,
        batch: &StepBatch,
        mut on_window: F,
    ) -> Result<(), EngineError>
    where
        E: InferenceEngine,
        F: FnMut(&mut E, Range<usize>),
    {
        let total = batch.len();
        let mut capacity = self.capacity_limit;
        let mut submitted = 0;

        while submitted < total {
            let end = total.min(submitted + capacity);
            match engine.decode(batch.window(submitted..end)) {
                DecodeStatus::Accepted => {
                    on_window(engine, submitted..end);
                    submitted = end;
                }
                DecodeStatus::Exhausted if capacity > 1 => {
                    capacity /= 2;
                    self.events += 1;
                    if self.verbosity.allows(Verbosity::Warnings) {
                        warn!(capacity, "decode window exhausted, halving sub-batch capacity");
                    }
                }
                DecodeStatus::Exhausted => return Err(EngineError::CapacityFloor),
                DecodeStatus::Failed(code) => return Err(EngineError::Decode(code)),
            }
        }

        Ok(())
    }
}
