//! Stop heuristics and response cleanup: marker tables, turn-boundary
//! detection, mid-stream stop-sequence matching, and output normalization.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::Verbosity;
use crate::engine::{InferenceEngine, TokenId};

/// Configured stop behavior, resolved into a [`StopTable`] at generator
/// construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StopSpec {
    /// Substrings removed from generated text during cleanup.
    pub markers: Vec<String>,
    /// "Next speaker" delimiters: generation stops once one appears and
    /// cleanup truncates the text there.
    pub turn_markers: Vec<String>,
    /// Texts resolved against the live vocabulary into token-id sequences
    /// matched mid-stream. Entries that do not tokenize to at least two
    /// tokens are dropped (single tokens are the engine's end-token job).
    pub stop_texts: Vec<String>,
    /// Decoded tokens required before the turn-marker heuristic applies.
    pub min_tokens_before_turn_check: usize,
}

impl Default for StopSpec {
    fn default() -> Self {
        Self {
            markers: [
                "<|im_end|>",
                "<|im_start|>",
                "<end_of_turn>",
                "<start_of_turn>",
                "</s>",
                "<s>",
                "<|endoftext|>",
                "<|end|>",
                "<|start|>",
                "<eos>",
                "<bos>",
                "\n<|im_end|>",
                "\n<end_of_turn>",
                "\n</s>",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            turn_markers: vec!["\n\nUser:".to_string(), "\n\nHuman:".to_string()],
            stop_texts: vec!["<|eot_id|>".to_string(), "<|end_header_id|>".to_string()],
            min_tokens_before_turn_check: 5,
        }
    }
}

/// Stop configuration resolved against one engine's vocabulary.
#[derive(Debug, Clone)]
pub struct StopTable {
    markers: Vec<String>,
    turn_markers: Vec<String>,
    min_tokens_before_turn_check: usize,
    sequences: Vec<Vec<TokenId>>,
    window_len: usize,
}

impl StopTable {
    /// Resolve `spec` against the engine's vocabulary.
    ///
    /// Stop texts that fail to tokenize or resolve to fewer than two tokens
    /// are dropped with a warning; resolution failures never abort
    /// construction.
    pub fn resolve<E: InferenceEngine>(spec: &StopSpec, engine: &E, verbosity: Verbosity) -> Self {
        let mut sequences = Vec::new();
        for text in &spec.stop_texts {
            match engine.tokenize(text) {
                Ok(tokens) if tokens.len() >= 2 => sequences.push(tokens),
                Ok(_) => {
                    if verbosity.allows(Verbosity::Warnings) {
                        warn!(stop_text = %text, "stop text is not a multi-token sequence, dropping");
                    }
                }
                Err(e) => {
                    if verbosity.allows(Verbosity::Warnings) {
                        warn!(stop_text = %text, error = %e, "failed to resolve stop text, dropping");
                    }
                }
            }
        }
        let window_len = sequences.iter().map(Vec::len).max().unwrap_or(0);

        Self {
            markers: spec.markers.clone(),
            turn_markers: spec.turn_markers.clone(),
            min_tokens_before_turn_check: spec.min_tokens_before_turn_check,
            sequences,
            window_len,
        }
    }

    /// Tokens of recent history each slot must retain for sequence
    /// matching; zero when no sequences resolved.
    pub fn window_len(&self) -> usize {
        self.window_len
    }

    /// If the recent window ends with a configured stop sequence, returns
    /// that sequence's length. Sequences are tried in configuration order.
    pub fn match_sequence(&self, recent: &VecDeque<(TokenId, usize)>) -> Option<usize> {
        for seq in &self.sequences {
            if recent.len() < seq.len() {
                continue;
            }
            let tail_matches = recent
                .iter()
                .rev()
                .map(|&(token, _)| token)
                .take(seq.len())
                .eq(seq.iter().rev().copied());
            if tail_matches {
                return Some(seq.len());
            }
        }
        None
    }

    /// Whether the turn-marker heuristic applies after `decoded` tokens.
    pub fn turn_check_ready(&self, decoded: usize) -> bool {
        decoded > self.min_tokens_before_turn_check
    }

    /// Whether the accumulated text contains a turn delimiter.
    pub fn hits_turn_marker(&self, text: &str) -> bool {
        self.turn_markers
            .iter()
            .any(|m| !m.is_empty() && text.contains(m.as_str()))
    }

    /// Normalize collected text: remove stop markers to a fixpoint,
    /// truncate at the earliest turn delimiter, strip leading
    /// non-printable/mojibake bytes and whitespace, trim the tail.
    ///
    /// Idempotent: cleaning cleaned text is a no-op.
    pub fn clean_response(&self, text: &str) -> String {
        let mut cleaned = text.to_string();

        // Marker removal can expose new markers; repeat until stable. Each
        // removal strictly shrinks the text, so this terminates.
        loop {
            let mut changed = false;
            for marker in &self.markers {
                if marker.is_empty() {
                    continue;
                }
                while let Some(pos) = cleaned.find(marker.as_str()) {
                    cleaned.replace_range(pos..pos + marker.len(), "");
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        if let Some(pos) = self
            .turn_markers
            .iter()
            .filter(|m| !m.is_empty())
            .filter_map(|m| cleaned.find(m.as_str()))
            .min()
        {
            cleaned.truncate(pos);
        }

        cleaned
            .trim_start_matches(|c: char| {
                c.is_whitespace() || c == '?' || (c as u32) < 0x20 || (c as u32) > 0x7e
            })
            .trim_end()
            .to_string()
    }
}
