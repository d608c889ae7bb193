//! Engine-facing contract: the stateful inference collaborator the scheduler
//! drives, plus the status and error types that cross that boundary.

use thiserror::Error;

use crate::batch::BatchWindow;

/// Vocabulary token identifier.
pub type TokenId = u32;

/// Engine-level sequence identifier. Identifier 0 is reserved for the
/// shared-prefix reference sequence; slots use 1..=max_sequences.
pub type SeqId = u32;

// ─── Status & Errors ─────────────────────────────────────────────────────────

/// Outcome of submitting one batch window to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    /// The window was accepted; its logits are readable until the next decode.
    Accepted,
    /// Transient capacity exhaustion. The same tokens may be resubmitted in
    /// smaller windows.
    Exhausted,
    /// Unrecoverable failure with an engine-specific status code.
    Failed(i32),
}

impl DecodeStatus {
    pub fn is_accepted(&self) -> bool {
        matches!(self, DecodeStatus::Accepted)
    }
}

/// Errors surfaced by the engine boundary or by batch submission.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("tokenization failed: {0}")]
    Tokenization(String),

    #[error("decode failed with engine status {0}")]
    Decode(i32),

    #[error("decode capacity exhausted at the single-token floor")]
    CapacityFloor,

    #[error("no logits available for batch row {0}")]
    Logits(usize),
}

// ─── Engine trait ────────────────────────────────────────────────────────────

/// A stateful autoregressive inference engine addressed by sequence id.
///
/// The scheduler treats decoding as opaque: it only sequences submissions,
/// reads logits rows, and manages per-sequence cache regions through the
/// three cache operations. Implementations own the key/value history for
/// every sequence id; cache mutations are only ever issued between `decode`
/// calls, never against one in flight.
pub trait InferenceEngine {
    /// Context window size in tokens.
    fn context_size(&self) -> usize;

    /// Maximum number of concurrently live sequences (excluding the shared
    /// prefix reference). Determines the slot pool size.
    fn max_sequences(&self) -> usize;

    /// Maximum token count the engine accepts in a single decode step.
    fn step_limit(&self) -> usize;

    /// Tokenize caller text. Fails on input the vocabulary cannot encode.
    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, EngineError>;

    /// Decoded text piece for a single token.
    fn token_to_piece(&self, token: TokenId) -> String;

    /// Whether the token is the engine's canonical end-of-generation token.
    fn is_end_token(&self, token: TokenId) -> bool;

    /// Submit one window of tokens. On `Accepted`, logits for rows that set
    /// the emit flag are readable via [`InferenceEngine::logits`] until the
    /// next `decode` call.
    fn decode(&mut self, window: BatchWindow<'_>) -> DecodeStatus;

    /// Logits for `row`, indexed relative to the last accepted window.
    fn logits(&self, row: usize) -> Result<&[f32], EngineError>;

    /// Copy the full cached history of `src` onto `dst`.
    fn cache_copy(&mut self, src: SeqId, dst: SeqId);

    /// Remove cached rows of `seq` at positions `from..`.
    fn cache_remove(&mut self, seq: SeqId, from: usize);

    /// Drop all cached state for every sequence.
    fn cache_clear(&mut self);
}

impl InferenceEngine for Box<dyn InferenceEngine> {
    fn context_size(&self) -> usize {
        (**self).context_size()
    }

    fn max_sequences(&self) -> usize {
        (**self).max_sequences()
    }

    fn step_limit(&self) -> usize {
        (**self).step_limit()
    }

    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, EngineError> {
        (**self).tokenize(text)
    }

    fn token_to_piece(&self, token: TokenId) -> String {
        (**self).token_to_piece(token)
    }

    fn is_end_token(&self, token: TokenId) -> bool {
        (**self).is_end_token(token)
    }

    fn decode(&mut self, window: BatchWindow<'_>) -> DecodeStatus {
        (**self).decode(window)
    }

    fn logits(&self, row: usize) -> Result<&[f32], EngineError> {
        (**self).logits(row)
    }

    fn cache_copy(&mut self, src: SeqId, dst: SeqId) {
        (**self).cache_copy(src, dst)
    }

    fn cache_remove(&mut self, seq: SeqId, from: usize) {
        (**self).cache_remove(seq, from)
    }

    fn cache_clear(&mut self) {
        (**self).cache_clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_status_accepted_check() {
        assert!(DecodeStatus::Accepted.is_accepted());
        assert!(!DecodeStatus::Exhausted.is_accepted());
        assert!(!DecodeStatus::Failed(-1).is_accepted());
    }

    #[test]
    fn error_messages_are_lowercase() {
        let e = EngineError::Decode(-7);
        assert_eq!(e.to_string(), "decode failed with engine status -7");
        let e = EngineError::Logits(3);
        assert_eq!(e.to_string(), "no logits available for batch row 3");
    }
}
