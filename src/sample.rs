//! Logits processing and token sampling.

use crate::config::GenerationSettings;
use crate::ops::softmax;
use rand::{Rng, RngExt};
use std::collections::HashSet;

/// Used for sorting probabilities in top-k / top-p sampling.
#[derive(Clone, Copy)]
pub struct ProbIndex {
    pub prob: f32,
    pub index: usize,
}

/// Knobs applied to the logits before a token is drawn.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplerParams {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: usize,
    pub repetition_penalty: f32,
    pub repetition_window: usize,
    /// Tokens that can never be drawn
    pub banned: Vec<i32>,
}

impl Default for SamplerParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 0.9,
            top_k: 0,
            repetition_penalty: 1.0,
            repetition_window: 0,
            banned: Vec::new(),
        }
    }
}

impl From<&GenerationSettings> for SamplerParams {
    fn from(settings: &GenerationSettings) -> Self {
        Self {
            temperature: settings.temperature,
            top_p: settings.top_p,
            top_k: settings.top_k,
            repetition_penalty: settings.token_repetition_penalty_max,
            repetition_window: settings.repetition_window,
            banned: Vec::new(),
        }
    }
}

/// Sample a token from logits, given the tokens generated so far.
///
/// - banned tokens and the repetition penalty are applied first
/// - `temperature == 0`: greedy (argmax)
/// - `top_k > 0` keeps the k most likely tokens
/// - `0 < top_p < 1` then keeps the smallest nucleus above `top_p`
pub fn sample<R: Rng>(
    logits: &mut [f32],
    params: &SamplerParams,
    history: &[i32],
    rng: &mut R,
) -> i32 {
    for &token in &params.banned {
        if let Some(l) = usize::try_from(token).ok().and_then(|i| logits.get_mut(i)) {
            *l = f32::NEG_INFINITY;
        }
    }
    apply_repetition_penalty(logits, params, history);

    if params.temperature == 0.0 {
        return argmax(logits) as i32;
    }

    for l in logits.iter_mut() {
        *l /= params.temperature;
    }
    softmax(logits);

    let r: f32 = rng.random();

    let nucleus = params.top_p > 0.0 && params.top_p < 1.0;
    if params.top_k == 0 && !nucleus {
        let mut cdf = 0.0f32;
        for (i, &p) in logits.iter().enumerate() {
            cdf += p;
            if r < cdf {
                return i as i32;
            }
        }
        return (logits.len() - 1) as i32;
    }

    let mut prob_index: Vec<ProbIndex> = logits
        .iter()
        .enumerate()
        .map(|(i, &p)| ProbIndex { prob: p, index: i })
        .collect();

    // Sort descending by probability
    prob_index.sort_by(|a, b| {
        b.prob
            .partial_cmp(&a.prob)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    if params.top_k > 0 {
        prob_index.truncate(params.top_k);
    }

    let mut cum_prob = 0.0f32;
    let mut last_idx = prob_index.len() - 1;
    for (i, pi) in prob_index.iter().enumerate() {
        cum_prob += pi.prob;
        if nucleus && cum_prob > params.top_p {
            last_idx = i;
            break;
        }
    }

    // Sample from truncated distribution
    let r_scaled = r * cum_prob;
    let mut cdf = 0.0f32;
    for pi in prob_index.iter().take(last_idx + 1) {
        cdf += pi.prob;
        if r_scaled < cdf {
            return pi.index as i32;
        }
    }

    prob_index[last_idx].index as i32
}

/// Push down the logits of tokens seen in the trailing window.
fn apply_repetition_penalty(logits: &mut [f32], params: &SamplerParams, history: &[i32]) {
    if params.repetition_penalty == 1.0 || params.repetition_window == 0 {
        return;
    }
    let start = history.len().saturating_sub(params.repetition_window);
    let seen: HashSet<i32> = history[start..].iter().copied().collect();
    for token in seen {
        if let Some(l) = usize::try_from(token).ok().and_then(|i| logits.get_mut(i)) {
            if *l >= 0.0 {
                *l /= params.repetition_penalty;
            } else {
                *l *= params.repetition_penalty;
            }
        }
    }
}

/// Returns the index of the maximum element.
#[inline]
fn argmax(x: &[f32]) -> usize {
    let mut max_idx = 0;
    let mut max_val = x[0];
    for (i, &v) in x.iter().enumerate().skip(1) {
        if v > max_val {
            max_val = v;
            max_idx = i;
        }
    }
    max_idx
}
