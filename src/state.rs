//! Runtime buffers for the forward pass.

use crate::config::ModelConfig;

/// Scratch buffers and the position-indexed KV cache.
#[derive(Debug, Clone)]
pub struct LlamaState {
    /// Current hidden state (hidden_states)
    pub x: Vec<f32>,
    /// Buffer for attention output before projection
    pub xb: Vec<f32>,
    /// Temp buffer for attention projection output
    pub xb2: Vec<f32>,
    /// FFN gate activation buffer
    pub hb: Vec<f32>,
    /// FFN up activation buffer
    pub hb2: Vec<f32>,
    pub q: Vec<f32>,
    pub k: Vec<f32>,
    pub v: Vec<f32>,
    pub logits: Vec<f32>,
    /// Key cache [n_layers][seq_len * kv_dim]
    pub key_cache: Vec<Vec<f32>>,
    /// Value cache [n_layers][seq_len * kv_dim]
    pub value_cache: Vec<Vec<f32>>,
}

impl LlamaState {
    pub fn new(config: &ModelConfig) -> Self {
        let dim = config.hidden_size;
        let hdim = config.intermediate_size;
        let kv_dim = config.kv_dim();
        let cache_len = config.max_position_embeddings * kv_dim;
        let cache = || vec![vec![0.0f32; cache_len]; config.num_hidden_layers];

        LlamaState {
            x: vec![0.0; dim],
            xb: vec![0.0; dim],
            xb2: vec![0.0; dim],
            hb: vec![0.0; hdim],
            hb2: vec![0.0; hdim],
            q: vec![0.0; dim],
            k: vec![0.0; kv_dim],
            v: vec![0.0; kv_dim],
            logits: vec![0.0; config.vocab_size],
            key_cache: cache(),
            value_cache: cache(),
        }
    }
}
