//! The slot-pool scheduler: assigns queued prompts to a fixed arena of
//! sequence slots, builds one combined batch per round, submits it through
//! the throttle, and drives every slot's state machine to finalization.
//!
//! Per-prompt failures (empty prompt, oversized prompt, sampler setup,
//! prefill decode, logits fetch) become inline `"[ERROR] "` entries and
//! never disturb sibling slots. A decode failure during the combined
//! generation batch is fatal for the whole call and propagates as `Err`.

use tracing::debug;

use crate::batch::StepBatch;
use crate::config::{GenerationParams, Verbosity};
use crate::engine::{EngineError, InferenceEngine, TokenId};
use crate::prefix::{PrefixState, PREFIX_SEQ_ID};
use crate::progress::ProgressMeter;
use crate::sampling::Sampler;
use crate::slot::{Slot, SlotPhase};
use crate::stop::StopTable;
use crate::throttle::BatchThrottle;

/// Prefix of inline per-prompt error entries in the output array.
pub const ERROR_PREFIX: &str = "[ERROR] ";

/// Tokens withheld from the context window when validating prompt length.
const CONTEXT_MARGIN: usize = 64;

/// Everything a finished scheduling run reports back.
#[derive(Debug)]
pub struct SchedulerOutcome {
    /// One entry per input prompt, in input order.
    pub outputs: Vec<String>,
    /// Prompt-to-slot binding events.
    pub assignments: usize,
    /// High-water mark of simultaneously active slots.
    pub peak_active_slots: usize,
    /// Tokens sampled across all slots.
    pub generated_tokens: usize,
    /// Slots driven through finalize (assigned prompts only; rejected
    /// prompts write their error without ever occupying a slot).
    pub finalized: usize,
}

/// One generation call's scheduling state.
pub struct Scheduler<'a, E: InferenceEngine> {
    engine: &'a mut E,
    throttle: &'a mut BatchThrottle,
    prompts: &'a [Vec<TokenId>],
    params: &'a GenerationParams,
    stop: &'a StopTable,
    prefix: PrefixState,
    seed_base: u64,
    verbosity: Verbosity,
    slots: Vec<Slot>,
    next_prompt: usize,
    outputs: Vec<String>,
    progress: ProgressMeter,
    assignments: usize,
    peak_active: usize,
    generated_tokens: usize,
}

impl<'a, E: InferenceEngine> Scheduler<'a, E> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: &'a mut E,
        throttle: &'a mut BatchThrottle,
        prompts: &'a [Vec<TokenId>],
        params: &'a GenerationParams,
        stop: &'a StopTable,
        prefix: PrefixState,
        seed_base: u64,
        verbosity: Verbosity,
    ) -> Self {
        let slot_count = engine.max_sequences().max(1);
        let slots = (0..slot_count).map(Slot::new).collect();
        let progress = ProgressMeter::new(prompts.len(), params.show_progress);

        Self {
            engine,
            throttle,
            prompts,
            params,
            stop,
            prefix,
            seed_base,
            verbosity,
            slots,
            next_prompt: 0,
            outputs: vec![String::new(); prompts.len()],
            progress,
            assignments: 0,
            peak_active: 0,
            generated_tokens: 0,
        }
    }

    /// Drive the loop to completion: fill free slots, submit one combined
    /// batch per round, finalize stopped slots, repeat until the queue is
    /// drained and no slot is active.
    pub fn run(mut self) -> Result<SchedulerOutcome, EngineError> {
        loop {
            self.fill_slots();

            let batch = self.build_round_batch();
            if batch.is_empty() {
                if self.next_prompt >= self.prompts.len() {
                    break;
                }
                continue;
            }

            if let Err(e) = self.advance_round(&batch) {
                self.progress.finish();
                return Err(e);
            }
        }

        self.progress.finish();
        let finalized = self.progress.completed();
        Ok(SchedulerOutcome {
            outputs: self.outputs,
            assignments: self.assignments,
            peak_active_slots: self.peak_active,
            generated_tokens: self.generated_tokens,
            finalized,
        })
    }

    /// Bind queued prompts to idle slots. Runs only between rounds, so a
    /// round's batch is never mutated while in flight.
    fn fill_slots(&mut self) {
        for slot_idx in 0..self.slots.len() {
            if !self.slots[slot_idx].phase.is_idle() {
                continue;
            }
            while self.next_prompt < self.prompts.len() {
                let prompt_index = self.next_prompt;
                self.next_prompt += 1;
                if self.try_assign(slot_idx, prompt_index) {
                    break;
                }
            }
        }

        let active = self.slots.iter().filter(|s| s.phase.is_active()).count();
        self.peak_active = self.peak_active.max(active);
    }

    /// Attempt to bind `prompt_index` to the idle slot at `slot_idx`,
    /// including the prefix copy and the prefill submission. Returns
    /// whether the slot reached `Decoding`; on rejection or prefill failure
    /// the prompt's error entry is written and the slot stays (or returns
    /// to) idle.
    fn try_assign(&mut self, slot_idx: usize, prompt_index: usize) -> bool {
        let tokens = &self.prompts[prompt_index];

        let Some((&last_token, _)) = tokens.split_last() else {
            self.write_error(prompt_index, "prompt resulted in zero tokens");
            return false;
        };
        if tokens.len() > self.engine.context_size().saturating_sub(CONTEXT_MARGIN) {
            self.write_error(prompt_index, "prompt too long for context size");
            return false;
        }
        let sampler = match Sampler::new(self.params, self.seed_base) {
            Ok(sampler) => sampler,
            Err(e) => {
                self.write_error(prompt_index, &format!("failed to initialize sampler: {e}"));
                return false;
            }
        };

        let prefix_len = self.prefix.slot_prefix_len(tokens.len());
        let suffix = tokens[prefix_len..].to_vec();

        self.slots[slot_idx].assign(
            prompt_index,
            tokens.len(),
            prefix_len,
            suffix,
            last_token,
            sampler,
        );
        self.assignments += 1;

        if prefix_len > 0 {
            let seq_id = self.slots[slot_idx].seq_id;
            self.engine.cache_copy(PREFIX_SEQ_ID, seq_id);
        }

        if self.verbosity.allows(Verbosity::Debug) {
            debug!(
                seq_id = self.slots[slot_idx].seq_id,
                prompt = prompt_index,
                prefix = prefix_len,
                suffix = self.slots[slot_idx].suffix.len(),
                "assigned prompt to slot"
            );
        }

        if self.slots[slot_idx].suffix.is_empty() {
            // Fully covered by the shared prefix; nothing to prefill.
            self.slots[slot_idx].begin_decoding();
            return true;
        }

        let batch = {
            let slot = &self.slots[slot_idx];
            let mut batch = StepBatch::with_capacity(slot.suffix.len());
            for (j, &token) in slot.suffix.iter().enumerate() {
                batch.push(
                    token,
                    slot.prefix_len + j,
                    &[slot.seq_id],
                    j == slot.suffix.len() - 1,
                );
            }
            batch
        };

        match self.throttle.submit(&mut *self.engine, &batch, |_, _| {}) {
            Ok(()) => {
                self.slots[slot_idx].begin_decoding();
                true
            }
            Err(e) => {
                let slot = &mut self.slots[slot_idx];
                slot.fail(format!("failed to decode prompt tokens: {e}"));
                finalize_slot(
                    self.engine,
                    slot,
                    self.stop,
                    &mut self.outputs,
                    &mut self.progress,
                    self.verbosity,
                );
                false
            }
        }
    }

    /// One pending token per `Decoding` slot, at position cached + decoded,
    /// logits requested on every row.
    fn build_round_batch(&mut self) -> StepBatch {
        let mut batch = StepBatch::new();
        for slot in &mut self.slots {
            if slot.phase != SlotPhase::Decoding {
                continue;
            }
            let position = slot.cached + slot.decoded;
            let row = batch.push(slot.last_token, position, &[slot.seq_id], true);
            slot.batch_row = Some(row);
        }
        batch
    }

    /// Submit the round's combined batch and advance every slot whose row
    /// was accepted: sample, evaluate the stop conditions, append text,
    /// finalize stopped slots. Returns `Err` only for unrecoverable decode
    /// failures, which abort the whole call.
    fn advance_round(&mut self, batch: &StepBatch) -> Result<(), EngineError> {
        let slots = &mut self.slots;
        let outputs = &mut self.outputs;
        let progress = &mut self.progress;
        let generated_tokens = &mut self.generated_tokens;
        let params = self.params;
        let stop = self.stop;
        let verbosity = self.verbosity;

        self.throttle.submit(&mut *self.engine, batch, |engine, range| {
            for slot in slots.iter_mut() {
                if slot.phase != SlotPhase::Decoding {
                    continue;
                }
                let Some(row) = slot.batch_row else {
                    continue;
                };
                if !range.contains(&row) {
                    continue;
                }

                let token = {
                    let Some(sampler) = slot.sampler.as_mut() else {
                        continue;
                    };
                    match engine.logits(row - range.start) {
                        Ok(logits) => {
                            let token = sampler.sample(logits);
                            sampler.accept(token);
                            token
                        }
                        Err(e) => {
                            slot.fail(format!("sampling failed: {e}"));
                            finalize_slot(engine, slot, stop, outputs, progress, verbosity);
                            continue;
                        }
                    }
                };

                let mut stopping = false;
                if engine.is_end_token(token) {
                    stopping = true;
                } else if params.max_tokens > 0 && slot.decoded >= params.max_tokens as usize {
                    stopping = true;
                } else {
                    let piece = engine.token_to_piece(token);
                    slot.push_recent(token, piece.len(), stop.window_len());
                    if let Some(matched) = stop.match_sequence(&slot.recent) {
                        // The sequence's earlier tokens were already
                        // appended; strip their pieces from the tail and
                        // drop the matching token itself.
                        let strip: usize = slot
                            .recent
                            .iter()
                            .rev()
                            .skip(1)
                            .take(matched - 1)
                            .map(|&(_, len)| len)
                            .sum();
                        let keep = slot.text.len().saturating_sub(strip);
                        slot.text.truncate(keep);
                        stopping = true;
                    } else {
                        slot.text.push_str(&piece);
                        if stop.turn_check_ready(slot.decoded) && stop.hits_turn_marker(&slot.text)
                        {
                            stopping = true;
                        }
                    }
                }

                slot.last_token = token;
                slot.decoded += 1;
                *generated_tokens += 1;
                slot.batch_row = None;

                if stopping {
                    slot.finish();
                    finalize_slot(engine, slot, stop, outputs, progress, verbosity);
                }
            }
        })
    }

    fn write_error(&mut self, prompt_index: usize, message: &str) {
        self.outputs[prompt_index] = format!("{ERROR_PREFIX}{message}");
    }
}

/// Shared finalize step: release the slot's cache rows, write the cleaned
/// text or the error entry at the originating prompt index, tick the
/// meter, and return the slot to the pool.
fn finalize_slot<E: InferenceEngine>(
    engine: &mut E,
    slot: &mut Slot,
    stop: &StopTable,
    outputs: &mut [String],
    progress: &mut ProgressMeter,
    verbosity: Verbosity,
) {
    debug_assert!(slot.phase.is_terminal());
    engine.cache_remove(slot.seq_id, 0);

    let failed = slot.phase == SlotPhase::Failed;
    outputs[slot.prompt_index] = if failed {
        format!("{ERROR_PREFIX}{}", slot.error)
    } else {
        stop.clean_response(&slot.text)
    };

    if verbosity.allows(Verbosity::Debug) {
        debug!(
            seq_id = slot.seq_id,
            prompt = slot.prompt_index,
            decoded = slot.decoded,
            failed,
            "slot finalized"
        );
    }

    progress.tick();
    slot.reset();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::DecodeStatus;
    use crate::stop::StopSpec;
    use crate::testing::MockEngine;

    fn greedy_params() -> GenerationParams {
        GenerationParams {
            temperature: 0.0,
            penalty_repeat: 1.0,
            max_tokens: 32,
            show_progress: false,
            ..Default::default()
        }
    }

    fn no_sequence_table(engine: &MockEngine) -> StopTable {
        let spec = StopSpec {
            stop_texts: Vec::new(),
            ..Default::default()
        };
        StopTable::resolve(&spec, engine, Verbosity::Errors)
    }

    fn run_scheduler(
        engine: &mut MockEngine,
        prompts: &[Vec<TokenId>],
        params: &GenerationParams,
        stop: &StopTable,
    ) -> Result<SchedulerOutcome, EngineError> {
        let mut throttle = BatchThrottle::new(512, Verbosity::Errors);
        Scheduler::new(
            engine,
            &mut throttle,
            prompts,
            params,
            stop,
            PrefixState::inactive(),
            7,
            Verbosity::Errors,
        )
        .run()
    }

    #[test]
    fn empty_prompt_list_returns_no_outputs() {
        let mut engine = MockEngine::new(100);
        let stop = no_sequence_table(&engine);
        let outcome = run_scheduler(&mut engine, &[], &greedy_params(), &stop).unwrap();

        assert!(outcome.outputs.is_empty());
        assert_eq!(outcome.assignments, 0);
        assert_eq!(engine.decode_call_count(), 0);
    }

    #[test]
    fn zero_token_prompt_writes_error_marker() {
        let mut engine = MockEngine::new(100);
        engine.script_completion(&[1, 2], &[5]);
        let stop = no_sequence_table(&engine);

        let prompts = vec![Vec::new(), vec![1, 2]];
        let outcome = run_scheduler(&mut engine, &prompts, &greedy_params(), &stop).unwrap();

        assert_eq!(
            outcome.outputs[0],
            format!("{ERROR_PREFIX}prompt resulted in zero tokens")
        );
        assert_eq!(outcome.outputs[1], "t5");
        assert_eq!(outcome.assignments, 1);
    }

    #[test]
    fn oversized_prompt_is_rejected_inline() {
        let mut engine = MockEngine::new(100).with_context_size(80);
        engine.script_completion(&[1], &[5]);
        let stop = no_sequence_table(&engine);

        // 80 minus the 64-token margin leaves room for 16 tokens.
        let long_prompt: Vec<TokenId> = (1..=17).collect();
        let prompts = vec![long_prompt, vec![1]];
        let outcome = run_scheduler(&mut engine, &prompts, &greedy_params(), &stop).unwrap();

        assert_eq!(
            outcome.outputs[0],
            format!("{ERROR_PREFIX}prompt too long for context size")
        );
        assert_eq!(outcome.outputs[1], "t5");
    }

    #[test]
    fn invalid_sampler_params_reject_every_prompt() {
        let mut engine = MockEngine::new(100);
        let stop = no_sequence_table(&engine);
        let params = GenerationParams {
            penalty_repeat: 0.0,
            ..greedy_params()
        };

        let prompts = vec![vec![1], vec![2]];
        let outcome = run_scheduler(&mut engine, &prompts, &params, &stop).unwrap();

        for output in &outcome.outputs {
            assert!(output.starts_with(ERROR_PREFIX), "{output}");
            assert!(output.contains("failed to initialize sampler"));
        }
        assert_eq!(outcome.assignments, 0);
    }

    #[test]
    fn five_prompts_share_two_slots_in_input_order() {
        let mut engine = MockEngine::new(100).with_max_sequences(2);
        for i in 0..5u32 {
            let prompt = vec![10 + i, 20 + i];
            engine.script_completion(&prompt, &[40 + i, 41 + i]);
        }
        let stop = no_sequence_table(&engine);

        let prompts: Vec<Vec<TokenId>> = (0..5u32).map(|i| vec![10 + i, 20 + i]).collect();
        let outcome = run_scheduler(&mut engine, &prompts, &greedy_params(), &stop).unwrap();

        assert_eq!(outcome.outputs.len(), 5);
        for (i, output) in outcome.outputs.iter().enumerate() {
            let i = i as u32;
            assert_eq!(output, &format!("t{} t{}", 40 + i, 41 + i));
        }
        assert_eq!(outcome.assignments, 5);
        assert_eq!(outcome.finalized, 5);
        assert_eq!(outcome.peak_active_slots, 2);
        assert!(engine.peak_live_sequences() <= 2);
    }

    #[test]
    fn first_round_resubmits_final_prompt_token() {
        let mut engine = MockEngine::new(100);
        engine.script_completion(&[1, 2, 3], &[9]);
        let stop = no_sequence_table(&engine);

        let prompts = vec![vec![1, 2, 3]];
        run_scheduler(&mut engine, &prompts, &greedy_params(), &stop).unwrap();

        let rows: Vec<(usize, TokenId)> = engine
            .accepted_rows()
            .iter()
            .filter(|(seq, _, _)| *seq == 1)
            .map(|&(_, pos, token)| (pos, token))
            .collect();
        // Prefill 0..3, then the prompt's final token again at position 3,
        // then the sampled token at position 4.
        assert_eq!(rows, vec![(0, 1), (1, 2), (2, 3), (3, 3), (4, 9)]);
    }

    #[test]
    fn prefill_failure_only_fails_that_prompt() {
        let mut engine = MockEngine::new(100);
        engine.script_completion(&[1, 2], &[5]);
        engine.script_completion(&[3, 4], &[6]);
        // Call 0 is the first prompt's prefill.
        engine.fail_decode_call(0, DecodeStatus::Failed(-2));
        let stop = no_sequence_table(&engine);

        let prompts = vec![vec![1, 2], vec![3, 4]];
        let outcome = run_scheduler(&mut engine, &prompts, &greedy_params(), &stop).unwrap();

        assert!(outcome.outputs[0].starts_with(ERROR_PREFIX));
        assert!(outcome.outputs[0].contains("failed to decode prompt tokens"));
        assert_eq!(outcome.outputs[1], "t6");
        assert_eq!(engine.cache_len(1), 0);
    }

    #[test]
    fn fatal_decode_in_generation_round_aborts_call() {
        let mut engine = MockEngine::new(100);
        engine.script_completion(&[1, 2], &[5, 6, 7]);
        // Call 0 prefills; call 1 is the first combined generation round.
        engine.fail_decode_call(1, DecodeStatus::Failed(-9));
        let stop = no_sequence_table(&engine);

        let prompts = vec![vec![1, 2]];
        let err = run_scheduler(&mut engine, &prompts, &greedy_params(), &stop).unwrap_err();
        assert!(matches!(err, EngineError::Decode(-9)));
    }

    #[test]
    fn floor_exhaustion_in_generation_round_is_fatal() {
        let mut engine = MockEngine::new(100).with_step_limit(1);
        engine.script_completion(&[1], &[5]);
        // With capacity 1 the single-token prefill is call 0; the first
        // generation round is call 1.
        engine.fail_decode_call(1, DecodeStatus::Exhausted);
        let stop = no_sequence_table(&engine);

        let prompts = vec![vec![1]];
        let mut throttle = BatchThrottle::new(1, Verbosity::Errors);
        let err = Scheduler::new(
            &mut engine,
            &mut throttle,
            &prompts,
            &greedy_params(),
            &stop,
            PrefixState::inactive(),
            7,
            Verbosity::Errors,
        )
        .run()
        .unwrap_err();
        assert!(matches!(err, EngineError::CapacityFloor));
    }

    #[test]
    fn max_tokens_caps_appended_output() {
        let mut engine = MockEngine::new(100);
        engine.script_completion(&[1], &[5, 6, 7, 8, 9]);
        let stop = no_sequence_table(&engine);
        let params = GenerationParams {
            max_tokens: 2,
            ..greedy_params()
        };

        let prompts = vec![vec![1]];
        let outcome = run_scheduler(&mut engine, &prompts, &params, &stop).unwrap();

        // Two tokens are appended; the third sample only triggers the stop.
        assert_eq!(outcome.outputs[0], "t5 t6");
        assert_eq!(outcome.generated_tokens, 3);
    }

    #[test]
    fn non_positive_max_tokens_never_caps_output() {
        let mut engine = MockEngine::new(100);
        engine.script_completion(&[1], &[5, 6, 7, 8, 9]);
        let stop = no_sequence_table(&engine);
        let params = GenerationParams {
            max_tokens: 0,
            ..greedy_params()
        };

        let prompts = vec![vec![1]];
        let outcome = run_scheduler(&mut engine, &prompts, &params, &stop).unwrap();

        // The budget is disabled; every scripted token is appended and the
        // run ends at the end token instead.
        assert_eq!(outcome.outputs[0], "t5 t6 t7 t8 t9");
        assert_eq!(outcome.generated_tokens, 6);
    }

    #[test]
    fn end_token_is_never_appended() {
        let mut engine = MockEngine::new(100);
        let eog = engine.eog_token();
        engine.script_completion(&[1], &[5, eog, 6]);
        let stop = no_sequence_table(&engine);

        let prompts = vec![vec![1]];
        let outcome = run_scheduler(&mut engine, &prompts, &greedy_params(), &stop).unwrap();

        assert_eq!(outcome.outputs[0], "t5");
    }

    #[test]
    fn stop_sequence_match_truncates_appended_tail() {
        let mut engine = MockEngine::new(100);
        engine.script_completion(&[1], &[5, 7, 8, 6]);
        let spec = StopSpec {
            stop_texts: vec!["t7 t8".to_string()],
            ..Default::default()
        };
        let stop = StopTable::resolve(&spec, &engine, Verbosity::Errors);

        let prompts = vec![vec![1]];
        let outcome = run_scheduler(&mut engine, &prompts, &greedy_params(), &stop).unwrap();

        // " t7" was appended before the match and is stripped again; the
        // matching token itself is never appended.
        assert_eq!(outcome.outputs[0], "t5");
    }

    #[test]
    fn turn_marker_stops_generation_after_minimum_tokens() {
        let mut engine = MockEngine::new(100);
        engine.override_piece(30, "\n\nUser:");
        engine.script_completion(&[1], &[2, 2, 2, 2, 2, 2, 30, 2]);
        let stop = no_sequence_table(&engine);

        let prompts = vec![vec![1]];
        let outcome = run_scheduler(&mut engine, &prompts, &greedy_params(), &stop).unwrap();

        // Six regular tokens, then the turn marker ends the slot; cleanup
        // truncates at the marker.
        assert_eq!(outcome.outputs[0], "t2 t2 t2 t2 t2 t2");
        assert_eq!(outcome.generated_tokens, 7);
    }

    #[test]
    fn logits_failure_fails_only_that_slot() {
        let mut engine = MockEngine::new(100).with_max_sequences(2);
        engine.script_completion(&[1], &[5]);
        engine.script_completion(&[2], &[6]);
        // Calls 0 and 1 prefill the two slots; call 2 is the first combined
        // round, rows 0 and 1. Fail the logits read for row 0 only.
        engine.fail_logits_at(2, 0);
        let stop = no_sequence_table(&engine);

        let prompts = vec![vec![1], vec![2]];
        let outcome = run_scheduler(&mut engine, &prompts, &greedy_params(), &stop).unwrap();

        assert!(outcome.outputs[0].contains("sampling failed"));
        assert_eq!(outcome.outputs[1], "t6");
    }

    #[test]
    fn shared_prefix_copies_reference_rows_before_prefill() {
        let mut engine = MockEngine::new(100);
        engine.script_completion(&[1, 2, 3], &[9]);
        engine.script_completion(&[1, 2, 4], &[8]);
        let stop = no_sequence_table(&engine);
        let params = greedy_params();

        let prompts = vec![vec![1, 2, 3], vec![1, 2, 4]];
        let mut throttle = BatchThrottle::new(512, Verbosity::Errors);
        let prefix = PrefixState::prime(&mut engine, &mut throttle, &prompts, Verbosity::Errors);
        assert_eq!(prefix.shared_len(), 2);

        let outcome = Scheduler::new(
            &mut engine,
            &mut throttle,
            &prompts,
            &params,
            &stop,
            prefix,
            7,
            Verbosity::Errors,
        )
        .run()
        .unwrap();

        assert_eq!(outcome.outputs, vec!["t9".to_string(), "t8".to_string()]);
        // Only the suffix token was prefilled per slot; positions 0..2 came
        // from the reference copy.
        let seq1_prefill: Vec<(usize, TokenId)> = engine
            .accepted_rows()
            .iter()
            .filter(|(seq, pos, _)| *seq == 1 && *pos < 3)
            .map(|&(_, pos, token)| (pos, token))
            .collect();
        assert_eq!(seq1_prefill, vec![(2, 3)]);
    }
}
