//! Step batch staging: the token rows for one engine submission.
//!
//! A [`StepBatch`] accumulates rows (token, position, target sequences, emit
//! flag) for one logical step; the throttle carves it into [`BatchWindow`]
//! views sized to the current capacity.

use std::ops::Range;

use crate::engine::{SeqId, TokenId};

/// One logical batch of token rows, built fresh each scheduler round.
#[derive(Debug, Clone, Default)]
pub struct StepBatch {
    tokens: Vec<TokenId>,
    positions: Vec<usize>,
    seq_ids: Vec<Vec<SeqId>>,
    emit_logits: Vec<bool>,
}

impl StepBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(rows: usize) -> Self {
        Self {
            tokens: Vec::with_capacity(rows),
            positions: Vec::with_capacity(rows),
            seq_ids: Vec::with_capacity(rows),
            emit_logits: Vec::with_capacity(rows),
        }
    }

    /// Append one row. Returns the row's index within the batch.
    pub fn push(&mut self, token: TokenId, position: usize, seqs: &[SeqId], emit: bool) -> usize {
        let row = self.tokens.len();
        self.tokens.push(token);
        self.positions.push(position);
        self.seq_ids.push(seqs.to_vec());
        self.emit_logits.push(emit);
        row
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn clear(&mut self) {
        self.tokens.clear();
        self.positions.clear();
        self.seq_ids.clear();
        self.emit_logits.clear();
    }

    /// Borrow the sub-range `range` as one submission window.
    pub fn window(&self, range: Range<usize>) -> BatchWindow<'_> {
        BatchWindow {
            tokens: &self.tokens[range.clone()],
            positions: &self.positions[range.clone()],
            seq_ids: &self.seq_ids[range.clone()],
            emit_logits: &self.emit_logits[range],
        }
    }
}

/// A contiguous view over part of a [`StepBatch`], passed to the engine as
/// one decode submission.
#[derive(Debug, Clone, Copy)]
pub struct BatchWindow<'a> {
    tokens: &'a [TokenId],
    positions: &'a [usize],
    seq_ids: &'a [Vec<SeqId>],
    emit_logits: &'a [bool],
}

/// One row of a window: a single token routed to one or more sequences.
#[derive(Debug, Clone, Copy)]
pub struct BatchRow<'a> {
    pub token: TokenId,
    pub position: usize,
    pub seq_ids: &'a [SeqId],
    pub emit_logits: bool,
}

impl<'a> BatchWindow<'a> {
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn rows(&self) -> impl Iterator<Item = BatchRow<'a>> + '_ {
        self.tokens.iter().enumerate().map(|(i, &token)| BatchRow {
            token,
            position: self.positions[i],
            seq_ids: &self.seq_ids[i],
            emit_logits: self.emit_logits[i],
        })
    }
}
