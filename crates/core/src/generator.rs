//! Public entry point: owns the engine, resolves the stop table once, and
//! runs one scheduling call per `generate_batch` invocation.
//!
//! Call-level contract: the engine cache is cleared on entry, every cache
//! row is released again on success, and an unrecoverable mid-call failure
//! clears the cache and returns `Err` without partial results.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::{error, info};

use crate::config::{GenerationParams, GeneratorConfig, Verbosity};
use crate::engine::{EngineError, InferenceEngine};
use crate::prefix::{PrefixState, PREFIX_SEQ_ID};
use crate::scheduler::{Scheduler, ERROR_PREFIX};
use crate::stop::StopTable;
use crate::throttle::BatchThrottle;

/// Counters for the most recent successful `generate_batch` call.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationStats {
    /// Tokens across all tokenized prompts.
    pub prompt_tokens: usize,
    /// Tokens sampled across all slots.
    pub generated_tokens: usize,
    /// Prompt-to-slot binding events.
    pub assignments: usize,
    /// High-water mark of simultaneously active slots.
    pub peak_active_slots: usize,
    /// Times the adaptive window was halved after an `Exhausted` verdict.
    pub throttle_events: u64,
    pub elapsed_secs: f64,
}

/// Continuous-batching generator over an opaque autoregressive engine.
pub struct BatchGenerator<E: InferenceEngine> {
    engine: E,
    stop: StopTable,
    share_prefix: bool,
    max_step_tokens: usize,
    verbosity: Verbosity,
    last_stats: Option<GenerationStats>,
}

impl<E: InferenceEngine> BatchGenerator<E> {
    /// Wrap `engine`. Stop sequences are resolved against the engine's
    /// vocabulary here, once, rather than per call.
    pub fn new(engine: E, config: GeneratorConfig) -> Self {
        let stop = StopTable::resolve(&config.stop, &engine, config.verbosity);
        Self {
            engine,
            stop,
            share_prefix: config.share_prefix,
            max_step_tokens: config.max_step_tokens,
            verbosity: config.verbosity,
            last_stats: None,
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn into_engine(self) -> E {
        self.engine
    }

    /// Counters from the most recent successful call, if any. Reset to
    /// `None` when a call fails.
    pub fn last_stats(&self) -> Option<&GenerationStats> {
        self.last_stats.as_ref()
    }

    /// Generate one completion per prompt, interleaved over the engine's
    /// fixed sequence slots. The result has exactly one entry per prompt in
    /// input order; recoverable per-prompt failures appear inline with an
    /// `"[ERROR] "` prefix.
    pub fn generate_batch<S: AsRef<str>>(
        &mut self,
        prompts: &[S],
        params: &GenerationParams,
    ) -> Result<Vec<String>, EngineError> {
        if prompts.is_empty() {
            return Ok(Vec::new());
        }
        let started = Instant::now();

        // Stale rows from an earlier call must never leak into this one.
        self.engine.cache_clear();

        let mut tokenized: Vec<Vec<_>> = Vec::with_capacity(prompts.len());
        let mut tokenize_errors: Vec<Option<String>> = vec![None; prompts.len()];
        for (i, prompt) in prompts.iter().enumerate() {
            match self.engine.tokenize(prompt.as_ref()) {
                Ok(tokens) => tokenized.push(tokens),
                Err(e) => {
                    tokenize_errors[i] = Some(e.to_string());
                    tokenized.push(Vec::new());
                }
            }
        }
        let prompt_tokens: usize = tokenized.iter().map(Vec::len).sum();

        let seed_base = resolve_seed(params.seed);
        let capacity = self.max_step_tokens.min(self.engine.step_limit());
        let mut throttle = BatchThrottle::new(capacity, self.verbosity);

        let prefix = if self.share_prefix {
            PrefixState::prime(&mut self.engine, &mut throttle, &tokenized, self.verbosity)
        } else {
            PrefixState::inactive()
        };
        let prefix_active = prefix.is_active();

        let outcome = Scheduler::new(
            &mut self.engine,
            &mut throttle,
            &tokenized,
            params,
            &self.stop,
            prefix,
            seed_base,
            self.verbosity,
        )
        .run();

        match outcome {
            Ok(outcome) => {
                if prefix_active {
                    self.engine.cache_remove(PREFIX_SEQ_ID, 0);
                }
                let mut outputs = outcome.outputs;
                for (i, failure) in tokenize_errors.iter().enumerate() {
                    if let Some(message) = failure {
                        outputs[i] = format!("{ERROR_PREFIX}{message}");
                    }
                }

                let stats = GenerationStats {
                    prompt_tokens,
                    generated_tokens: outcome.generated_tokens,
                    assignments: outcome.assignments,
                    peak_active_slots: outcome.peak_active_slots,
                    throttle_events: throttle.events(),
                    elapsed_secs: started.elapsed().as_secs_f64(),
                };
                if self.verbosity.allows(Verbosity::Info) {
                    info!(
                        prompts = prompts.len(),
                        prompt_tokens = stats.prompt_tokens,
                        generated = stats.generated_tokens,
                        assignments = stats.assignments,
                        peak_active = stats.peak_active_slots,
                        throttle_events = stats.throttle_events,
                        elapsed_secs = stats.elapsed_secs,
                        "batch generation finished"
                    );
                }
                self.last_stats = Some(stats);
                Ok(outputs)
            }
            Err(e) => {
                // No partial results: drop every cache row and report the
                // failure as-is.
                self.engine.cache_clear();
                if self.verbosity.allows(Verbosity::Errors) {
                    error!(error = %e, "batch generation aborted");
                }
                self.last_stats = None;
                Err(e)
            }
        }
    }
}

/// Negative seeds draw one clock-derived base per call; every slot's
/// sampler in that call starts from the same base.
fn resolve_seed(seed: i64) -> u64 {
    if seed < 0 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    } else {
        seed as u64
    }
}
