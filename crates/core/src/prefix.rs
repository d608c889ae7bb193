//! Shared-prefix priming: the longest common prompt prefix is decoded once
//! under the reference sequence so slots can copy it instead of recomputing.

use tracing::{info, warn};

use crate::batch::StepBatch;
use crate::config::Verbosity;
use crate::engine::{InferenceEngine, SeqId, TokenId};
use crate::throttle::BatchThrottle;

/// Reference sequence id the shared prefix is decoded under.
pub const PREFIX_SEQ_ID: SeqId = 0;

/// Length of the longest prefix shared by prompt 0 and every other prompt.
///
/// Prompt 0 is the reference: each prompt is intersected pairwise against
/// it, which is not a general LCP over all pairs. A single prompt shares
/// its entire token list with itself.
pub fn shared_prefix_len(prompts: &[Vec<TokenId>]) -> usize {
    let Some(first) = prompts.first() else {
        return 0;
    };
    let mut shared = first.len();
    for prompt in &prompts[1..] {
        let common = first
            .iter()
            .zip(prompt.iter())
            .take_while(|(a, b)| a == b)
            .count();
        shared = shared.min(common);
        if shared == 0 {
            break;
        }
    }
    shared
}

/// Result of prefix priming, consulted at slot assignment time.
#[derive(Debug, Clone, Copy)]
pub struct PrefixState {
    shared_len: usize,
    active: bool,
}

impl PrefixState {
    /// Sharing disabled, skipped, or nothing in common.
    pub fn inactive() -> Self {
        Self {
            shared_len: 0,
            active: false,
        }
    }

    /// Decode the shared prefix of `prompts` under the reference sequence.
    ///
    /// Any decode failure here clears the cache and disables sharing for
    /// the call; it is never fatal.
    pub fn prime<E: InferenceEngine>(
        engine: &mut E,
        throttle: &mut BatchThrottle,
        prompts: &[Vec<TokenId>],
        verbosity: Verbosity,
    ) -> Self {
        let shared_len = shared_prefix_len(prompts);
        if shared_len == 0 {
            return Self::inactive();
        }

        let reference = &prompts[0];
        let mut batch = StepBatch::with_capacity(shared_len);
        for (pos, &token) in reference[..shared_len].iter().enumerate() {
            batch.push(token, pos, &[PREFIX_SEQ_ID], pos == shared_len - 1);
        }

        match throttle.submit(engine, &batch, |_, _| {}) {
            Ok(()) => {
                if verbosity.allows(Verbosity::Info) {
                    info!(tokens = shared_len, "primed shared prompt prefix");
                }
                Self {
                    shared_len,
                    active: true,
                }
            }
            Err(e) => {
                engine.cache_clear();
                if verbosity.allows(Verbosity::Warnings) {
                    warn!(error = %e, "shared prefix decode failed, disabling prefix sharing");
                }
                Self::inactive()
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Shared prefix length, zero when sharing is inactive.
    pub fn shared_len(&self) -> usize {
        if self.active {
            self.shared_len
        } else {
            0
        }
    }

    /// Usable prefix length for a prompt of `prompt_len` tokens.
    pub fn slot_prefix_len(&self, prompt_len: usize) -> usize {
        self.shared_len().min(prompt_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::DecodeStatus;
    use crate::testing::MockEngine;

    #[test]
    fn no_prompts_share_nothing() {
        assert_eq!(shared_prefix_len(&[]), 0);
    }

    #[test]
    fn single_prompt_shares_itself_entirely() {
        assert_eq!(shared_prefix_len(&[vec![5, 6, 7]]), 3);
    }

    #[test]
    fn pairwise_intersection_against_first_prompt() {
        let prompts = vec![vec![1, 2, 3, 4], vec![1, 2, 9, 9], vec![1, 2, 3, 9]];
        assert_eq!(shared_prefix_len(&prompts), 2);
    }

    #[test]
    fn disjoint_prompts_share_nothing() {
        let prompts = vec![vec![1, 2], vec![3, 4]];
        assert_eq!(shared_prefix_len(&prompts), 0);
    }

    #[test]
    fn shorter_reference_bounds_the_prefix() {
        let prompts = vec![vec![1, 2], vec![1, 2, 3, 4]];
        assert_eq!(shared_prefix_len(&prompts), 2);
    }

    #[test]
    fn prime_seeds_reference_sequence() {
        let mut engine = MockEngine::new(100);
        let mut throttle = BatchThrottle::new(512, Verbosity::Errors);
        let prompts = vec![vec![1, 2, 3], vec![1, 2, 9]];

        let state = PrefixState::prime(&mut engine, &mut throttle, &prompts, Verbosity::Errors);

        assert!(state.is_active());
        assert_eq!(state.shared_len(), 2);
        assert_eq!(engine.cache_len(PREFIX_SEQ_ID), 2);
        assert_eq!(state.slot_prefix_len(3), 2);
        assert_eq!(state.slot_prefix_len(1), 1);
    }

    #[test]
    fn empty_shared_prefix_skips_priming() {
        let mut engine = MockEngine::new(100);
        let mut throttle = BatchThrottle::new(512, Verbosity::Errors);
        let prompts = vec![vec![1, 2], vec![3, 4]];

        let state = PrefixState::prime(&mut engine, &mut throttle, &prompts, Verbosity::Errors);

        assert!(!state.is_active());
        assert_eq!(engine.decode_call_count(), 0);
    }

    #[test]
    fn prime_failure_clears_cache_and_disables_sharing() {
        let mut engine = MockEngine::new(100);
        engine.fail_decode_call(0, DecodeStatus::Failed(-1));
        let mut throttle = BatchThrottle::new(512, Verbosity::Errors);
        let prompts = vec![vec![1, 2, 3], vec![1, 2, 9]];

        let state = PrefixState::prime(&mut engine, &mut throttle, &prompts, Verbosity::Errors);

        assert!(!state.is_active());
        assert_eq!(state.shared_len(), 0);
        assert_eq!(state.slot_prefix_len(3), 0);
        assert!(engine.cache_is_empty());
    }

    #[test]
    fn prime_floor_exhaustion_is_recoverable() {
        let mut engine = MockEngine::new(100);
        engine.fail_decode_call(0, DecodeStatus::Exhausted);
        // Capacity 1 turns the first exhaustion into a floor failure.
        let mut throttle = BatchThrottle::new(1, Verbosity::Errors);
        let prompts = vec![vec![1, 2, 3], vec![1, 2, 9]];

        let state = PrefixState::prime(&mut engine, &mut throttle, &prompts, Verbosity::Errors);

        assert!(!state.is_active());
        assert!(engine.cache_is_empty());
    }
}
