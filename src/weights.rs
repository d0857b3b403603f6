//! Model weights for Llama.

use crate::config::ModelConfig;
use crate::error::Result;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Read;

/// Weights for a single decoder layer.
#[derive(Debug, Clone)]
pub struct LlamaLayerWeights {
    /// Input RMSNorm weights (input_layernorm)
    pub attn_norm: Vec<f32>,
    /// Query projection (self_attn.q_proj.weight)
    pub q_proj: Vec<f32>,
    /// Key projection (self_attn.k_proj.weight)
    pub k_proj: Vec<f32>,
    /// Value projection (self_attn.v_proj.weight)
    pub v_proj: Vec<f32>,
    /// Output projection (self_attn.o_proj.weight)
    pub o_proj: Vec<f32>,
    /// Post-attention RMSNorm weights (post_attention_layernorm)
    pub ffn_norm: Vec<f32>,
    /// Gate projection in MLP (mlp.gate_proj.weight)
    pub gate_proj: Vec<f32>,
    /// Up projection in MLP (mlp.up_proj.weight)
    pub up_proj: Vec<f32>,
    /// Down projection in MLP (mlp.down_proj.weight)
    pub down_proj: Vec<f32>,
}

/// All model parameters; the output head is tied to `embed_tokens`.
#[derive(Debug, Clone)]
pub struct LlamaWeights {
    /// Token embeddings (model.embed_tokens.weight)
    pub embed_tokens: Vec<f32>,
    /// Decoder layers (model.layers)
    pub layers: Vec<LlamaLayerWeights>,
    /// Final RMSNorm (model.norm.weight)
    pub norm: Vec<f32>,
}

impl LlamaWeights {
    /// Read the llama2.c checkpoint body that follows the header.
    ///
    /// Tensors are stored grouped by kind across all layers, so each group is
    /// split into per-layer chunks.
    pub fn load<R: Read>(reader: &mut R, config: &ModelConfig) -> Result<Self> {
        let dim = config.hidden_size;
        let hdim = config.intermediate_size;
        let n_layers = config.num_hidden_layers;
        let kv_dim = config.kv_dim();

        let embed_tokens = read_f32_vec(reader, config.vocab_size * dim)?;

        let mut attn_norm = read_layers(reader, n_layers, dim)?;
        let mut q_proj = read_layers(reader, n_layers, dim * dim)?;
        let mut k_proj = read_layers(reader, n_layers, dim * kv_dim)?;
        let mut v_proj = read_layers(reader, n_layers, dim * kv_dim)?;
        let mut o_proj = read_layers(reader, n_layers, dim * dim)?;
        let mut ffn_norm = read_layers(reader, n_layers, dim)?;
        let mut gate_proj = read_layers(reader, n_layers, hdim * dim)?;
        let mut down_proj = read_layers(reader, n_layers, dim * hdim)?;
        let mut up_proj = read_layers(reader, n_layers, hdim * dim)?;
        let norm = read_f32_vec(reader, dim)?;

        let mut layers = Vec::with_capacity(n_layers);
        for _ in 0..n_layers {
            layers.push(LlamaLayerWeights {
                attn_norm: attn_norm.remove(0),
                q_proj: q_proj.remove(0),
                k_proj: k_proj.remove(0),
                v_proj: v_proj.remove(0),
                o_proj: o_proj.remove(0),
                ffn_norm: ffn_norm.remove(0),
                gate_proj: gate_proj.remove(0),
                up_proj: up_proj.remove(0),
                down_proj: down_proj.remove(0),
            });
        }

        Ok(LlamaWeights {
            embed_tokens,
            layers,
            norm,
        })
    }
}

/// Read `n_layers` consecutive tensors of `per_layer` values each.
fn read_layers<R: Read>(reader: &mut R, n_layers: usize, per_layer: usize) -> Result<Vec<Vec<f32>>> {
    (0..n_layers)
        .map(|_| read_f32_vec(reader, per_layer))
        .collect()
}

fn read_f32_vec<R: Read>(reader: &mut R, count: usize) -> Result<Vec<f32>> {
    let mut buf = vec![0f32; count];
    reader.read_f32_into::<LittleEndian>(&mut buf)?;
    Ok(buf)
}
