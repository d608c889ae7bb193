//! Per-slot token sampling: repetition penalty over a rolling window,
//! temperature scaling, top-k/top-p filtering, and a seeded CDF draw.

use std::collections::VecDeque;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

use crate::config::GenerationParams;
use crate::engine::TokenId;

/// Rejected sampler parameter combinations, surfaced as that prompt's
/// inline error result.
#[derive(Debug, Error, PartialEq)]
pub enum SamplerError {
    #[error("temperature must be finite, got {0}")]
    InvalidTemperature(f32),

    #[error("top_p must be finite and non-negative, got {0}")]
    InvalidTopP(f32),

    #[error("penalty_repeat must be finite and positive, got {0}")]
    InvalidRepeatPenalty(f32),
}

/// Independent sampling state for one slot: parameter snapshot, RNG chain,
/// and the rolling window feeding the repetition penalty.
pub struct Sampler {
    temperature: f32,
    top_p: f32,
    top_k: i32,
    penalty_repeat: f32,
    repeat_last_n: i32,
    rng: StdRng,
    recent: VecDeque<TokenId>,
}

impl Sampler {
    pub fn new(params: &GenerationParams, seed: u64) -> Result<Self, SamplerError> {
        if !params.temperature.is_finite() {
            return Err(SamplerError::InvalidTemperature(params.temperature));
        }
        if !params.top_p.is_finite() || params.top_p < 0.0 {
            return Err(SamplerError::InvalidTopP(params.top_p));
        }
        if !params.penalty_repeat.is_finite() || params.penalty_repeat <= 0.0 {
            return Err(SamplerError::InvalidRepeatPenalty(params.penalty_repeat));
        }

        Ok(Self {
            temperature: params.temperature,
            top_p: params.top_p,
            top_k: params.top_k,
            penalty_repeat: params.penalty_repeat,
            repeat_last_n: params.repeat_last_n,
            rng: StdRng::seed_from_u64(seed),
            recent: VecDeque::new(),
        })
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature < 1e-6
    }

    /// Record an accepted token in the rolling repetition window.
    ///
    /// A negative `repeat_last_n` keeps the whole history; zero disables the
    /// window entirely.
    pub fn accept(&mut self, token: TokenId) {
        if self.repeat_last_n == 0 {
            return;
        }
        self.recent.push_back(token);
        if self.repeat_last_n > 0 {
            while self.recent.len() > self.repeat_last_n as usize {
                self.recent.pop_front();
            }
        }
    }

    /// Sample the next token from a logits row.
    ///
    /// Pipeline: repetition penalty over the rolling window, greedy fast
    /// path, temperature scaling, softmax, top-k, top-p, renormalize, CDF
    /// draw.
    pub fn sample(&mut self, logits: &[f32]) -> TokenId {
        let vocab_size = logits.len();
        let mut logits = logits.to_vec();

        if self.penalty_repeat != 1.0 && !self.recent.is_empty() {
            apply_repetition_penalty(&mut logits, self.recent.iter().copied(), self.penalty_repeat);
        }

        if self.is_greedy() {
            return argmax(&logits);
        }

        if self.temperature != 1.0 {
            let inv_temp = 1.0 / self.temperature;
            for logit in logits.iter_mut() {
                *logit *= inv_temp;
            }
        }

        let mut probs = softmax(&logits);

        if self.top_k > 0 && (self.top_k as usize) < vocab_size {
            apply_top_k(&mut probs, self.top_k as usize);
        }

        if self.top_p > 0.0 && self.top_p < 1.0 {
            apply_top_p(&mut probs, self.top_p);
        }

        let sum: f32 = probs.iter().sum();
        if sum > 0.0 && sum != 1.0 {
            let inv_sum = 1.0 / sum;
            for p in probs.iter_mut() {
                *p *= inv_sum;
            }
        }

        sample_from_probs(&probs, &mut self.rng)
    }
}

fn apply_repetition_penalty<I>(logits: &mut [f32], recent: I, penalty: f32)
where
    I: IntoIterator<Item = TokenId>,
{
    for token_id in recent {
        let idx = token_id as usize;
        if idx < logits.len() {
            if logits[idx] > 0.0 {
                logits[idx] /= penalty;
            } else {
                logits[idx] *= penalty;
            }
        }
    }
}

fn apply_top_k(probs: &mut [f32], k: usize) {
    let mut sorted: Vec<f32> = probs.to_vec();
    sorted.sort_unstable_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    let threshold = sorted[k.min(sorted.len()) - 1];
    for p in probs.iter_mut() {
        if *p < threshold {
            *p = 0.0;
        }
    }
}

fn apply_top_p(probs: &mut [f32], top_p: f32) {
    let mut indexed: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
    indexed.sort_unstable_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut cumsum = 0.0f32;
    let mut cutoff_idx = indexed.len();
    for (i, &(_, p)) in indexed.iter().enumerate() {
        cumsum += p;
        if cumsum > top_p {
            cutoff_idx = i + 1;
            break;
        }
    }

    for &(idx, _) in &indexed[cutoff_idx..] {
        probs[idx] = 0.0;
    }
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max_logit = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut probs: Vec<f32> = logits.iter().map(|&l| (l - max_logit).exp()).collect();
    let sum: f32 = probs.iter().sum();
    if sum > 0.0 {
        let inv_sum = 1.0 / sum;
        for p in probs.iter_mut() {
            *p *= inv_sum;
        }
    }
    probs
}

fn argmax(values: &[f32]) -> TokenId {
    values
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i as TokenId)
        .unwrap_or(0)
}

fn sample_from_probs(probs: &[f32], rng: &mut StdRng) -> TokenId {
    let r: f32 = rng.gen();
    let mut cumsum = 0.0f32;
    for (i, &p) in probs.iter().enumerate() {
        cumsum += p;
        if r < cumsum {
            return i as TokenId;
        }
    }
    // Fallback: return last token index
    probs.len() as TokenId - 1
}
