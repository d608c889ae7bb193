//! Slot arena entries: the per-sequence generation state the scheduler
//! multiplexes queued prompts onto.

use std::collections::VecDeque;

use crate::engine::{SeqId, TokenId};
use crate::sampling::Sampler;

/// Lifecycle phase of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotPhase {
    /// Free for assignment.
    Idle,
    /// Bound to a prompt; prefill not yet complete.
    Assigned,
    /// Fully prefilled; contributes one token per round.
    Decoding,
    /// Stopped normally; awaiting finalize.
    Finished,
    /// Stopped with a per-prompt error; awaiting finalize.
    Failed,
}

impl SlotPhase {
    pub fn is_idle(&self) -> bool {
        matches!(self, SlotPhase::Idle)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, SlotPhase::Assigned | SlotPhase::Decoding)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SlotPhase::Finished | SlotPhase::Failed)
    }
}

/// One preallocated slot of the pool.
///
/// The sequence id is fixed at construction (slot index + 1, id 0 being the
/// shared-prefix reference); every other field is per-prompt state reset in
/// place when the slot is released.
pub struct Slot {
    pub seq_id: SeqId,
    pub phase: SlotPhase,
    /// Index of the originating prompt in the input order.
    pub prompt_index: usize,
    /// Full token count of the bound prompt.
    pub prompt_len: usize,
    /// Prompt tokens still to be prefilled (past the usable prefix).
    pub suffix: Vec<TokenId>,
    /// Usable shared-prefix length for this prompt.
    pub prefix_len: usize,
    /// Rows of this sequence already in the cache.
    pub cached: usize,
    /// Tokens sampled so far.
    pub decoded: usize,
    /// Token submitted on the next round: the last sampled token, or the
    /// prompt's final token before the first sample.
    pub last_token: TokenId,
    /// Row index in the current round's combined batch, if any.
    pub batch_row: Option<usize>,
    pub sampler: Option<Sampler>,
    /// Recently sampled tokens with their piece byte lengths, for
    /// stop-sequence matching.
    pub recent: VecDeque<(TokenId, usize)>,
    /// Accumulated generated text, pre-cleanup.
    pub text: String,
    /// Failure message for the inline error entry.
    pub error: String,
}

impl Slot {
    pub fn new(index: usize) -> Self {
        Self {
            seq_id: index as SeqId + 1,
            phase: SlotPhase::Idle,
            prompt_index: 0,
            prompt_len: 0,
            suffix: Vec::new(),
            prefix_len: 0,
            cached: 0,
            decoded: 0,
            last_token: 0,
            batch_row: None,
            sampler: None,
            recent: VecDeque::new(),
            text: String::new(),
            error: String::new(),
        }
    }

    /// Bind a prompt to this slot: `Idle → Assigned`.
    pub fn assign(
        &mut self,
        prompt_index: usize,
        prompt_len: usize,
        prefix_len: usize,
        suffix: Vec<TokenId>,
        last_token: TokenId,
        sampler: Sampler,
    ) {
        debug_assert!(self.phase.is_idle());
        self.phase = SlotPhase::Assigned;
        self.prompt_index = prompt_index;
        self.prompt_len = prompt_len;
        self.prefix_len = prefix_len;
        self.cached = prefix_len;
        self.suffix = suffix;
        self.decoded = 0;
        self.last_token = last_token;
        self.batch_row = None;
        self.sampler = Some(sampler);
        self.recent.clear();
        self.text.clear();
        self.error.clear();
    }

    /// Prefill complete: `Assigned → Decoding`. The whole prompt is cached
    /// from here on.
    pub fn begin_decoding(&mut self) {
        debug_assert_eq!(self.phase, SlotPhase::Assigned);
        self.phase = SlotPhase::Decoding;
        self.cached = self.prompt_len;
        self.suffix = Vec::new();
    }

    /// Normal stop: `Decoding → Finished`.
    pub fn finish(&mut self) {
        debug_assert_eq!(self.phase, SlotPhase::Decoding);
        self.phase = SlotPhase::Finished;
    }

    /// Per-prompt failure from any active phase.
    pub fn fail(&mut self, message: impl Into<String>) {
        debug_assert!(self.phase.is_active());
        self.phase = SlotPhase::Failed;
        self.error = message.into();
    }

    /// Release back to the pool: terminal phase → `Idle`, sequence id kept.
    pub fn reset(&mut self) {
        debug_assert!(self.phase.is_terminal());
        self.phase = SlotPhase::Idle;
        self.prompt_index = 0;
        self.prompt_len = 0;
        self.suffix = Vec::new();
        self.prefix_len = 0;
        self.cached = 0;
        self.decoded = 0;
        self.last_token = 0;
        self.batch_row = None;
        self.sampler = None;
        self.recent.clear();
        self.text.clear();
        self.error.clear();
    }

    /// Record a sampled token and its piece length in the stop-sequence
    /// window, trimmed to `window` entries.
    pub fn push_recent(&mut self, token: TokenId, piece_len: usize, window: usize) {
        if window == 0 {
            return;
        }
        self.recent.push_back((token, piece_len));
        while self.recent.len() > window {
            self.recent.pop_front();
        }
    }
}
