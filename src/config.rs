//! Model configuration and generation settings.

use crate::error::{PredictError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Transformer hyperparameters, read from the checkpoint's `config.json`.
///
/// Field names follow LlamaConfig in Hugging Face Transformers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    /// Transformer embedding dimension
    pub hidden_size: usize,
    /// FFN intermediate dimension
    pub intermediate_size: usize,
    /// Number of decoder layers
    pub num_hidden_layers: usize,
    /// Number of query attention heads
    pub num_attention_heads: usize,
    /// Number of key/value heads for GQA, defaults to the query head count
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    pub vocab_size: usize,
    /// Maximum context length
    pub max_position_embeddings: usize,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f32,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f32,
    #[serde(default = "default_bos_token_id")]
    pub bos_token_id: i32,
    #[serde(default = "default_eos_token_id")]
    pub eos_token_id: i32,
}

fn default_rms_norm_eps() -> f32 {
    1e-5
}

fn default_rope_theta() -> f32 {
    10000.0
}

fn default_bos_token_id() -> i32 {
    1
}

fn default_eos_token_id() -> i32 {
    2
}

impl ModelConfig {
    /// Parse and validate a `config.json` file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let config: ModelConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("hidden_size", self.hidden_size),
            ("intermediate_size", self.intermediate_size),
            ("num_hidden_layers", self.num_hidden_layers),
            ("num_attention_heads", self.num_attention_heads),
            ("num_key_value_heads", self.n_kv_heads()),
            ("vocab_size", self.vocab_size),
            ("max_position_embeddings", self.max_position_embeddings),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(PredictError::InvalidConfig(format!("{name} must be > 0")));
            }
        }
        if self.hidden_size % self.num_attention_heads != 0 {
            return Err(PredictError::InvalidConfig(
                "hidden_size must be divisible by num_attention_heads".into(),
            ));
        }
        if self.num_attention_heads % self.n_kv_heads() != 0 {
            return Err(PredictError::InvalidConfig(
                "num_attention_heads must be divisible by num_key_value_heads".into(),
            ));
        }
        if self.head_size() % 2 != 0 {
            return Err(PredictError::InvalidConfig(
                "head size must be even for rotary embeddings".into(),
            ));
        }
        Ok(())
    }

    /// Number of key/value heads.
    #[inline]
    pub fn n_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    /// Returns the key/value dimension per head group.
    #[inline]
    pub fn kv_dim(&self) -> usize {
        (self.hidden_size * self.n_kv_heads()) / self.num_attention_heads
    }

    /// Returns the head size.
    #[inline]
    pub fn head_size(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Returns the number of heads per KV group (for GQA).
    #[inline]
    pub fn group_size(&self) -> usize {
        self.num_attention_heads / self.n_kv_heads()
    }
}

/// Settings handed to the generator, fixed for the lifetime of a predictor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GenerationSettings {
    /// Decode budget for both entry points
    pub max_new_tokens: usize,
    /// Penalty applied to logits of recently seen tokens (1.0 disables)
    pub token_repetition_penalty_max: f32,
    /// How many trailing tokens the repetition penalty looks at
    pub repetition_window: usize,
    /// 0 selects greedy decoding
    pub temperature: f32,
    pub top_p: f32,
    /// 0 disables the top-k cut
    pub top_k: usize,
    /// Accepted for compatibility, the built-in engine does not do typical sampling
    pub typical: f32,
    pub seed: u64,
    /// Case-insensitive literal that ends `generate_to_eos` early
    pub stop_text: String,
    /// Never sample the end-of-sequence token
    pub ban_eos: bool,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            max_new_tokens: 128,
            token_repetition_penalty_max: 1.15,
            repetition_window: 256,
            temperature: 0.95,
            top_p: 0.75,
            top_k: 40,
            typical: 0.0,
            seed: 0,
            stop_text: "###".into(),
            ban_eos: true,
        }
    }
}

impl GenerationSettings {
    /// Load settings from a TOML file; missing keys keep their defaults.
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let settings: GenerationSettings = toml::from_str(&raw)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_new_tokens == 0 {
            return Err(PredictError::InvalidConfig(
                "max_new_tokens must be > 0".into(),
            ));
        }
        if !(self.temperature >= 0.0) {
            return Err(PredictError::InvalidConfig(
                "temperature must be >= 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(PredictError::InvalidConfig(
                "top_p must be within [0, 1]".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.typical) {
            return Err(PredictError::InvalidConfig(
                "typical must be within [0, 1]".into(),
            ));
        }
        if !(self.token_repetition_penalty_max >= 1.0) {
            return Err(PredictError::InvalidConfig(
                "token_repetition_penalty_max must be >= 1".into(),
            ));
        }
        Ok(())
    }
}
