//! A scriptable in-memory engine for exercising the scheduler without a
//! real model.
//!
//! The vocabulary is `t0..t{n-1}` (word-level, whitespace-split, `t0` as
//! the unknown token), the highest id is the end-of-generation token, and
//! logits are one-hot over the scripted next token so greedy and
//! stochastic samplers agree. Decode calls can be failed by index and
//! logits reads by (call, row) to drive the recovery paths.

use ahash::{AHashMap, AHashSet};
use tokenizers::Tokenizer;

use crate::batch::{BatchRow, BatchWindow};
use crate::engine::{DecodeStatus, EngineError, InferenceEngine, SeqId, TokenId};
use crate::prefix::PREFIX_SEQ_ID;

pub struct MockEngine {
    vocab_size: usize,
    context_size: usize,
    max_sequences: usize,
    step_limit: usize,
    eog: TokenId,
    tokenizer: Tokenizer,
    pieces: AHashMap<TokenId, String>,
    scripts: Vec<(Vec<TokenId>, Vec<TokenId>)>,
    tokenize_failures: AHashSet<String>,
    decode_failures: AHashMap<usize, DecodeStatus>,
    logits_failures: AHashSet<(usize, usize)>,
    cache: AHashMap<SeqId, Vec<(usize, TokenId)>>,
    decode_calls: usize,
    attempt_sizes: Vec<usize>,
    accepted_rows: Vec<(SeqId, usize, TokenId)>,
    last_logits: Vec<Vec<f32>>,
    last_failing: AHashSet<usize>,
    peak_live: usize,
}

impl MockEngine {
    pub fn new(vocab_size: usize) -> Self {
        use tokenizers::models::wordlevel::WordLevel;
        use tokenizers::pre_tokenizers::whitespace::Whitespace;

        let mut vocab = AHashMap::new();
        for i in 0..vocab_size {
            vocab.insert(format!("t{i}"), i as u32);
        }
        let model = WordLevel::builder()
            .vocab(vocab)
            .unk_token("t0".into())
            .build()
            .expect("build mock tokenizer model");
        let mut tokenizer = Tokenizer::new(model);
        tokenizer.with_pre_tokenizer(Some(Whitespace {}));

        Self {
            vocab_size,
            context_size: 4096,
            max_sequences: 4,
            step_limit: 512,
            eog: vocab_size.saturating_sub(1) as TokenId,
            tokenizer,
            pieces: AHashMap::new(),
            scripts: Vec::new(),
            tokenize_failures: AHashSet::new(),
            decode_failures: AHashMap::new(),
            logits_failures: AHashSet::new(),
            cache: AHashMap::new(),
            decode_calls: 0,
            attempt_sizes: Vec::new(),
            accepted_rows: Vec::new(),
            last_logits: Vec::new(),
            last_failing: AHashSet::new(),
            peak_live: 0,
        }
    }

    pub fn with_context_size(mut self, n: usize) -> Self {
        self.context_size = n;
        self
    }

    pub fn with_max_sequences(mut self, n: usize) -> Self {
        self.max_sequences = n;
        self
    }

    pub fn with_step_limit(mut self, n: usize) -> Self {
        self.step_limit = n;
        self
    }

    pub fn eog_token(&self) -> TokenId {
        self.eog
    }

    /// After `prompt` is in a sequence's cache, emit `completion` token by
    /// token, then end-of-generation. Longest matching prompt wins when
    /// several scripts apply.
    pub fn script_completion(&mut self, prompt: &[TokenId], completion: &[TokenId]) {
        self.scripts.push((prompt.to_vec(), completion.to_vec()));
    }

    /// Replace the decoded piece for `token` (default `" t{id}"`).
    pub fn override_piece(&mut self, token: TokenId, piece: &str) {
        self.pieces.insert(token, piece.to_string());
    }

    /// Make `tokenize` fail for this exact prompt text.
    pub fn fail_tokenize(&mut self, prompt: &str) {
        self.tokenize_failures.insert(prompt.to_string());
    }

    /// Script the n-th `decode` call (counting every submission, including
    /// retries) to return `status` instead of accepting.
    pub fn fail_decode_call(&mut self, call: usize, status: DecodeStatus) {
        self.decode_failures.insert(call, status);
    }

    /// Make the logits read for `row` of the window accepted by decode
    /// call `call` fail.
    pub fn fail_logits_at(&mut self, call: usize, row: usize) {
        self.logits_failures.insert((call, row));
    }

    pub fn decode_call_count(&self) -> usize {
        self.decode_calls
    }

    pub fn cache_len(&self, seq: SeqId) -> usize {
        self.cache.get(&seq).map_or(0, Vec::len)
    }

    pub fn cache_is_empty(&self) -> bool {
        self.cache.values().all(Vec::is_empty)
    }

    /// High-water mark of sequences holding cache rows, excluding the
    /// shared-prefix reference.
    pub fn peak_live_sequences(&self) -> usize {
        self.peak_live
    }

    /// Every accepted row, in submission order, as (seq, position, token).
    pub fn accepted_rows(&self) -> &[(SeqId, usize, TokenId)] {
        &self.accepted_rows
    }

    /// Row counts of every decode attempt, accepted or not.
    pub fn attempt_sizes(&self) -> &[usize] {
        &self.attempt_sizes
    }

    /// The scripted token following `row`, or end-of-generation when the
    /// row's sequence matches no script or has run past its completion.
    fn scripted_next(&self, row: BatchRow<'_>) -> TokenId {
        let seq = row.seq_ids.first().copied().unwrap_or(PREFIX_SEQ_ID);
        let tokens: Vec<TokenId> = self
            .cache
            .get(&seq)
            .map(|rows| rows.iter().map(|&(_, token)| token).collect())
            .unwrap_or_default();

        let mut best: Option<&(Vec<TokenId>, Vec<TokenId>)> = None;
        for script in &self.scripts {
            let prompt = &script.0;
            if tokens.len() >= prompt.len() && tokens[..prompt.len()] == prompt[..] {
                if best.map_or(true, |b| prompt.len() > b.0.len()) {
                    best = Some(script);
                }
            }
        }
        let Some((prompt, completion)) = best else {
            return self.eog;
        };
        match row.position.checked_sub(prompt.len()) {
            Some(idx) if idx < completion.len() => completion[idx],
            _ => self.eog,
        }
    }
}

impl InferenceEngine for MockEngine {
    fn context_size(&self) -> usize {
        self.context_size
    }

    fn max_sequences(&self) -> usize {
        self.max_sequences
    }

    fn step_limit(&self) -> usize {
        self.step_limit
    }

    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, EngineError> {
        if self.tokenize_failures.contains(text) {
            return Err(EngineError::Tokenization(
                "scripted tokenizer failure".to_string(),
            ));
        }
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| EngineError::Tokenization(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn token_to_piece(&self, token: TokenId) -> String {
        self.pieces
            .get(&token)
            .cloned()
            .unwrap_or_else(|| format!(" t{token}"))
    }

    fn is_end_token(&self, token: TokenId) -> bool {
        token == self.eog
    }

    fn decode(&mut self, window: BatchWindow<'_>) -> DecodeStatus {
        let call = self.decode_calls;
        self.decode_calls += 1;
        self.attempt_sizes.push(window.len());

        if let Some(&status) = self.decode_failures.get(&call) {
            if !status.is_accepted() {
                return status;
            }
        }

        for row in window.rows() {
            for &seq in row.seq_ids {
                self.cache
                    .entry(seq)
                    .or_default()
                    .push((row.position, row.token));
                self.accepted_rows.push((seq, row.position, row.token));
            }
        }

        let live = self
            .cache
            .iter()
            .filter(|(seq, rows)| **seq != PREFIX_SEQ_ID && !rows.is_empty())
            .count();
        self.peak_live = self.peak_live.max(live);

        self.last_logits.clear();
        self.last_failing.clear();
        for (idx, row) in window.rows().enumerate() {
            if self.logits_failures.contains(&(call, idx)) {
                self.last_failing.insert(idx);
                self.last_logits.push(Vec::new());
                continue;
            }
            let next = self.scripted_next(row);
            let mut logits = vec![-100.0f32; self.vocab_size];
            if let Some(slot) = logits.get_mut(next as usize) {
                *slot = 100.0;
            }
            self.last_logits.push(logits);
        }

        DecodeStatus::Accepted
    }

    fn logits(&self, row: usize) -> Result<&[f32], EngineError> {
        if row >= self.last_logits.len() || self.last_failing.contains(&row) {
            return Err(EngineError::Logits(row));
        }
        Ok(&self.last_logits[row])
    }

    fn cache_copy(&mut self, src: SeqId, dst: SeqId) {
        let rows = self.cache.get(&src).cloned().unwrap_or_default();
        self.cache.insert(dst, rows);
    }

    fn cache_remove(&mut self, seq: SeqId, from: usize) {
        if let Some(rows) = self.cache.get_mut(&seq) {
            rows.retain(|&(pos, _)| pos < from);
        }
    }

    fn cache_clear(&mut self) {
        self.cache.clear();
    }
}
