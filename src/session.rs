//! In-process generation session over the Llama forward pass.

use crate::config::ModelConfig;
use crate::engine::Generator;
use crate::error::{PredictError, Result};
use crate::model::forward;
use crate::sample::{SamplerParams, sample};
use crate::state::LlamaState;
use crate::weights::LlamaWeights;
use rand::SeedableRng;
use rand::rngs::StdRng;

/// Owns a loaded model plus the live token sequence it is extending.
///
/// `cached` is the number of leading positions whose keys and values are
/// valid in the cache. Rewinding or patching the sequence only lowers it;
/// the next sample replays whatever lies past it.
pub struct LlamaSession {
    config: ModelConfig,
    weights: LlamaWeights,
    state: LlamaState,
    sequence: Vec<i32>,
    cached: usize,
    sampler: SamplerParams,
    rng: StdRng,
}

impl LlamaSession {
    pub fn new(config: ModelConfig, weights: LlamaWeights, sampler: SamplerParams, seed: u64) -> Self {
        let state = LlamaState::new(&config);
        LlamaSession {
            config,
            weights,
            state,
            sequence: Vec::new(),
            cached: 0,
            sampler,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn sampler(&self) -> &SamplerParams {
        &self.sampler
    }

    /// Never sample any of `tokens` from now on.
    pub fn disallow_tokens(&mut self, tokens: &[i32]) {
        for &token in tokens {
            if !self.sampler.banned.contains(&token) {
                self.sampler.banned.push(token);
            }
        }
    }

    /// Restart the sampling RNG.
    pub fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    /// Extend `prompt` by up to `max_new_tokens`, stopping early on `eos`.
    ///
    /// A sampled `eos` is not kept in the sequence. Returns how many tokens
    /// were appended.
    pub fn generate_simple(&mut self, prompt: &[i32], max_new_tokens: usize, eos: i32) -> Result<usize> {
        self.begin(prompt)?;
        let mut generated = 0;
        for _ in 0..max_new_tokens {
            let token = self.next_token()?;
            if token == eos {
                self.rewind(1)?;
                break;
            }
            generated += 1;
        }
        Ok(generated)
    }

    /// Bring the cache up to date so `state.logits` predicts the next token.
    fn sync(&mut self) -> Result<()> {
        let len = self.sequence.len();
        if len == 0 {
            return Err(PredictError::EmptySequence);
        }
        // The last position always runs, its logits are what we sample from.
        let start = self.cached.min(len - 1);
        for pos in start..len {
            forward(
                self.sequence[pos],
                pos,
                &self.config,
                &mut self.state,
                &self.weights,
            )?;
        }
        self.cached = len;
        Ok(())
    }

    fn check_token(&self, token: i32) -> Result<()> {
        match usize::try_from(token) {
            Ok(t) if t < self.config.vocab_size => Ok(()),
            _ => Err(PredictError::InvalidToken(token)),
        }
    }
}

impl Generator for LlamaSession {
    fn begin(&mut self, tokens: &[i32]) -> Result<()> {
        if tokens.is_empty() {
            return Err(PredictError::EmptySequence);
        }
        if tokens.len() > self.config.max_position_embeddings {
            return Err(PredictError::ContextOverflow {
                limit: self.config.max_position_embeddings,
            });
        }
        for &token in tokens {
            self.check_token(token)?;
        }
        self.sequence.clear();
        self.sequence.extend_from_slice(tokens);
        self.cached = 0;
        Ok(())
    }

    fn next_token(&mut self) -> Result<i32> {
        if self.sequence.len() >= self.config.max_position_embeddings {
            return Err(PredictError::ContextOverflow {
                limit: self.config.max_position_embeddings,
            });
        }
        self.sync()?;
        let token = sample(
            &mut self.state.logits,
            &self.sampler,
            &self.sequence,
            &mut self.rng,
        );
        self.sequence.push(token);
        Ok(token)
    }

    fn sequence(&self) -> &[i32] {
        &self.sequence
    }

    fn replace_last_token(&mut self, token: i32) -> Result<()> {
        self.check_token(token)?;
        let len = self.sequence.len();
        let last = self
            .sequence
            .last_mut()
            .ok_or(PredictError::EmptySequence)?;
        *last = token;
        self.cached = self.cached.min(len - 1);
        Ok(())
    }

    fn rewind(&mut self, n: usize) -> Result<()> {
        let len = self.sequence.len();
        if n > len {
            return Err(PredictError::Rewind { requested: n, len });
        }
        self.sequence.truncate(len - n);
        self.cached = self.cached.min(len - n);
        Ok(())
    }
}
