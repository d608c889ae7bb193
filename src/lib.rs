//! Continuous-batching text generation over an opaque autoregressive
//! engine.
//!
//! The scheduling machinery lives in `genpool-core`; this crate re-exports
//! the public surface and adds process-level logging setup. Implement
//! [`InferenceEngine`] for your backend, wrap it in a [`BatchGenerator`],
//! and call `generate_batch` with a list of prompts.

pub mod logging;

pub use genpool_core::batch::{BatchRow, BatchWindow, StepBatch};
pub use genpool_core::config::{GenerationParams, GeneratorConfig, Verbosity};
pub use genpool_core::engine::{DecodeStatus, EngineError, InferenceEngine, SeqId, TokenId};
pub use genpool_core::generator::{BatchGenerator, GenerationStats};
pub use genpool_core::prefix::PREFIX_SEQ_ID;
pub use genpool_core::scheduler::ERROR_PREFIX;
pub use genpool_core::stop::StopSpec;
