//! Llama model forward pass.

use crate::config::ModelConfig;
use crate::error::{PredictError, Result};
use crate::ops::{accum, apply_rotary_emb, matmul, rms_norm, softmax, swiglu};
use crate::state::LlamaState;
use crate::weights::{LlamaLayerWeights, LlamaWeights};
use byteorder::{LittleEndian, ReadBytesExt};
use rayon::prelude::*;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Load weights from a llama2.c checkpoint, checking its header against `config.json`.
pub fn load_model<P: AsRef<Path>>(path: P, config: &ModelConfig) -> Result<LlamaWeights> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let mut header = [0i32; 7];
    reader.read_i32_into::<LittleEndian>(&mut header)?;
    let [dim, hidden_dim, n_layers, n_heads, n_kv_heads, vocab_size, seq_len] = header;

    if vocab_size < 0 {
        return Err(PredictError::InvalidModel(
            "checkpoints with an unshared classifier are not supported".into(),
        ));
    }

    let expected = [
        ("hidden_size", dim, config.hidden_size),
        ("intermediate_size", hidden_dim, config.intermediate_size),
        ("num_hidden_layers", n_layers, config.num_hidden_layers),
        ("num_attention_heads", n_heads, config.num_attention_heads),
        ("num_key_value_heads", n_kv_heads, config.n_kv_heads()),
        ("vocab_size", vocab_size, config.vocab_size),
        ("max_position_embeddings", seq_len, config.max_position_embeddings),
    ];
    for (name, found, want) in expected {
        if usize::try_from(found).ok() != Some(want) {
            return Err(PredictError::InvalidModel(format!(
                "checkpoint header has {name} = {found}, config.json says {want}"
            )));
        }
    }

    LlamaWeights::load(&mut reader, config)
}

/// Run one token at `pos` through the model, leaving logits in `state.logits`.
///
/// Keys and values for `pos` are written into the cache; positions after it
/// are ignored, so overwriting a later position replays from there.
pub fn forward(
    token: i32,
    pos: usize,
    config: &ModelConfig,
    state: &mut LlamaState,
    weights: &LlamaWeights,
) -> Result<()> {
    let dim = config.hidden_size;

    if pos >= config.max_position_embeddings {
        return Err(PredictError::ContextOverflow {
            limit: config.max_position_embeddings,
        });
    }
    let row = usize::try_from(token)
        .ok()
        .filter(|&t| t < config.vocab_size)
        .ok_or(PredictError::InvalidToken(token))?;

    // Token embedding
    let emb_offset = row * dim;
    state
        .x
        .copy_from_slice(&weights.embed_tokens[emb_offset..emb_offset + dim]);

    for (l, layer) in weights.layers.iter().enumerate() {
        attention(l, pos, config, state, layer);
        mlp(config, state, layer);
    }

    // Final norm
    let x_clone = state.x.clone();
    rms_norm(&mut state.x, &x_clone, &weights.norm, config.rms_norm_eps);

    // Logits (tied embeddings)
    matmul(&mut state.logits, &state.x, &weights.embed_tokens);
    Ok(())
}

/// Self-attention for one layer, aligned with LlamaAttention.forward.
fn attention(
    layer_idx: usize,
    pos: usize,
    config: &ModelConfig,
    state: &mut LlamaState,
    layer_weights: &LlamaLayerWeights,
) {
    let n_heads = config.num_attention_heads;
    let head_size = config.head_size();
    let kv_dim = config.kv_dim();
    let group_size = config.group_size();

    // Input norm
    rms_norm(
        &mut state.xb,
        &state.x,
        &layer_weights.attn_norm,
        config.rms_norm_eps,
    );

    // QKV projections
    matmul(&mut state.q, &state.xb, &layer_weights.q_proj);
    matmul(&mut state.k, &state.xb, &layer_weights.k_proj);
    matmul(&mut state.v, &state.xb, &layer_weights.v_proj);

    // Apply RoPE
    apply_rotary_emb(&mut state.q, pos, head_size, config.rope_theta);
    apply_rotary_emb(&mut state.k, pos, head_size, config.rope_theta);

    // Cache K and V
    let cache_offset = pos * kv_dim;
    state.key_cache[layer_idx][cache_offset..cache_offset + kv_dim].copy_from_slice(&state.k);
    state.value_cache[layer_idx][cache_offset..cache_offset + kv_dim].copy_from_slice(&state.v);

    // Multi-head attention, one rayon task per head
    let key_cache = &state.key_cache[layer_idx];
    let value_cache = &state.value_cache[layer_idx];
    let scale = (head_size as f32).sqrt().recip();

    let head_outputs: Vec<Vec<f32>> = (0..n_heads)
        .into_par_iter()
        .map(|h| {
            let q = &state.q[h * head_size..(h + 1) * head_size];
            let kv_off = (h / group_size) * head_size;

            let mut att: Vec<f32> = (0..=pos)
                .map(|t| {
                    let k = &key_cache[t * kv_dim + kv_off..][..head_size];
                    q.iter().zip(k).map(|(a, b)| a * b).sum::<f32>() * scale
                })
                .collect();
            softmax(&mut att);

            let mut out = vec![0.0f32; head_size];
            for (t, &a) in att.iter().enumerate() {
                let v = &value_cache[t * kv_dim + kv_off..][..head_size];
                for (o, &vi) in out.iter_mut().zip(v) {
                    *o += a * vi;
                }
            }
            out
        })
        .collect();

    for (dst, out) in state.xb.chunks_exact_mut(head_size).zip(head_outputs) {
        dst.copy_from_slice(&out);
    }

    // Output projection
    matmul(&mut state.xb2, &state.xb, &layer_weights.o_proj);

    // Residual add
    accum(&mut state.x, &state.xb2);
}

/// FFN for one layer, aligned with LlamaMLP.forward.
fn mlp(config: &ModelConfig, state: &mut LlamaState, layer_weights: &LlamaLayerWeights) {
    // Input norm
    rms_norm(
        &mut state.xb,
        &state.x,
        &layer_weights.ffn_norm,
        config.rms_norm_eps,
    );

    // Gate and up projections
    matmul(&mut state.hb, &state.xb, &layer_weights.gate_proj);
    matmul(&mut state.hb2, &state.xb, &layer_weights.up_proj);

    // SwiGLU activation
    swiglu(&mut state.hb, &state.hb2);

    // Down projection
    matmul(&mut state.xb, &state.hb, &layer_weights.down_proj);

    // Residual add
    accum(&mut state.x, &state.xb);
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;
    use std::io::Write;

    fn config() -> ModelConfig {
        ModelConfig {
            hidden_size: 4,
            intermediate_size: 8,
            num_hidden_layers: 1,
            num_attention_heads: 2,
            num_key_value_heads: Some(1),
            vocab_size: 5,
            max_position_embeddings: 3,
            rms_norm_eps: 1e-5,
            rope_theta: 10000.0,
            bos_token_id: 1,
            eos_token_id: 2,
        }
    }

    fn write_checkpoint(path: &Path, header: [i32; 7], floats: usize) {
        let mut file = File::create(path).unwrap();
        for v in header {
            file.write_i32::<LittleEndian>(v).unwrap();
        }
        for i in 0..floats {
            file.write_f32::<LittleEndian>((i as f32 * 0.37).sin() * 0.1)
                .unwrap();
        }
        file.flush().unwrap();
    }

    /// Floats in a tied checkpoint for `config()`.
    fn body_len(c: &ModelConfig) -> usize {
        let (d, h, kv) = (c.hidden_size, c.intermediate_size, c.kv_dim());
        c.vocab_size * d + d + d * d + 2 * d * kv + d * d + d + 3 * h * d + d
    }

    #[test]
    fn loads_and_runs_within_context() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.bin");
        let c = config();
        write_checkpoint(&path, [4, 8, 1, 2, 1, 5, 3], body_len(&c));

        let weights = load_model(&path, &c).unwrap();
        assert_eq!(weights.layers.len(), 1);
        assert_eq!(weights.layers[0].k_proj.len(), 4 * 2);

        let mut state = LlamaState::new(&c);
        for pos in 0..3 {
            forward(1, pos, &c, &mut state, &weights).unwrap();
            assert!(state.logits.iter().all(|l| l.is_finite()));
        }
        assert!(matches!(
            forward(1, 3, &c, &mut state, &weights),
            Err(PredictError::ContextOverflow { limit: 3 })
        ));
        assert!(matches!(
            forward(7, 0, &c, &mut state, &weights),
            Err(PredictError::InvalidToken(7))
        ));
    }

    #[test]
    fn header_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.bin");
        let c = config();
        write_checkpoint(&path, [4, 8, 2, 2, 1, 5, 3], body_len(&c));

        let err = load_model(&path, &c).unwrap_err();
        assert!(err.to_string().contains("num_hidden_layers"));
    }

    #[test]
    fn truncated_body_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.bin");
        let c = config();
        write_checkpoint(&path, [4, 8, 1, 2, 1, 5, 3], body_len(&c) - 1);

        assert!(matches!(load_model(&path, &c), Err(PredictError::Io(_))));
    }
}
