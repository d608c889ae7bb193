//! Caller-facing configuration: per-call generation parameters, generator
//! construction options, and the call-scoped diagnostics verbosity.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::stop::StopSpec;

/// Per-call sampling and scheduling parameters, applied identically (but
/// with independent state) to every slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    /// Hard cap on decoded tokens per prompt; `<= 0` means unbounded until
    /// another stop condition fires.
    pub max_tokens: i32,
    /// Keep only the `top_k` most likely tokens; `<= 0` disables.
    pub top_k: i32,
    /// Nucleus sampling mass; `>= 1.0` disables.
    pub top_p: f32,
    /// Sampling temperature; values below `1e-6` select greedily.
    pub temperature: f32,
    /// Rolling repetition window. `< 0` penalizes over the whole history,
    /// `0` disables the penalty.
    pub repeat_last_n: i32,
    /// Repetition penalty divisor applied to tokens in the window; `1.0`
    /// disables.
    pub penalty_repeat: f32,
    /// RNG seed. Negative draws a time-derived base once per call, shared
    /// by every slot.
    pub seed: i64,
    /// Render the textual progress meter to stderr.
    pub show_progress: bool,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            top_k: 40,
            top_p: 0.95,
            temperature: 0.8,
            repeat_last_n: 64,
            penalty_repeat: 1.1,
            seed: -1,
            show_progress: false,
        }
    }
}

/// How chatty the scheduler's diagnostics are for one generator instance.
///
/// This is call-scoped configuration, not process state: it gates which
/// `tracing` events the scheduler emits, independent of the subscriber's
/// own filtering.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Errors,
    #[default]
    Warnings,
    Info,
    Debug,
}

impl Verbosity {
    /// Whether events at `level` should be emitted under this setting.
    pub fn allows(self, level: Verbosity) -> bool {
        self >= level
    }
}

/// Construction-time options for a [`crate::generator::BatchGenerator`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Prime the longest common prompt prefix once under the reference
    /// sequence and copy it into matching slots.
    pub share_prefix: bool,
    /// Upper bound on tokens per decode step, further clamped to the
    /// engine's own step limit.
    pub max_step_tokens: usize,
    /// Stop markers, turn markers, and stop-sequence texts.
    pub stop: StopSpec,
    /// Diagnostics verbosity for this generator.
    pub verbosity: Verbosity,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            share_prefix: true,
            max_step_tokens: 512,
            stop: StopSpec::default(),
            verbosity: Verbosity::default(),
        }
    }
}

impl GeneratorConfig {
    pub fn from_json_str(content: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&content)
    }
}
