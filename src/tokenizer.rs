//! Tokenizer loading, BPE encoding and sequence decoding.

use crate::config::ModelConfig;
use crate::error::{PredictError, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// Offset of the 256 `<0xXX>` byte tokens in a llama vocabulary.
const BYTE_TOKEN_OFFSET: i32 = 3;

/// `<unk>` sits in front of BOS and EOS in a llama vocabulary.
const UNK_ID: i32 = 0;

/// Text <-> token conversion as seen by the decode loop.
pub trait Codec {
    /// Encode text, optionally prefixed with the BOS token.
    fn encode(&self, text: &str, bos: bool) -> Result<Vec<i32>>;

    /// Decode a run of tokens back into text.
    fn decode(&self, tokens: &[i32]) -> Result<String>;
}

/// Tokenizer holding vocabulary, scores and the special ids.
#[derive(Debug, Clone)]
pub struct Tokenizer {
    pub vocab: Vec<String>,
    pub scores: Vec<f32>,
    pub vocab_map: HashMap<String, i32>,
    pub max_token_len: u32,
    pub bos_id: i32,
    pub eos_id: i32,
    newline_id: Option<i32>,
}

impl Tokenizer {
    /// Build a tokenizer from an in-memory vocabulary.
    pub fn new(vocab: Vec<String>, scores: Vec<f32>, bos_id: i32, eos_id: i32) -> Self {
        let vocab_map: HashMap<String, i32> = vocab
            .iter()
            .enumerate()
            .map(|(i, piece)| (piece.clone(), i as i32))
            .collect();
        let newline_id = vocab_map
            .get("<0x0A>")
            .or_else(|| vocab_map.get("\n"))
            .copied();
        let max_token_len = vocab.iter().map(|p| p.len() as u32).max().unwrap_or(0);

        Tokenizer {
            vocab,
            scores,
            vocab_map,
            max_token_len,
            bos_id,
            eos_id,
            newline_id,
        }
    }

    /// Token used in place of EOS when generation ends on it.
    pub fn newline_id(&self) -> Result<i32> {
        self.newline_id
            .ok_or_else(|| PredictError::Tokenizer("vocabulary has no newline token".into()))
    }

    /// Raw vocabulary entry for a token id.
    pub fn piece(&self, token: i32) -> Option<&str> {
        usize::try_from(token)
            .ok()
            .and_then(|i| self.vocab.get(i))
            .map(|s| s.as_str())
    }
}

impl Codec for Tokenizer {
    fn encode(&self, text: &str, bos: bool) -> Result<Vec<i32>> {
        let bos = bos.then_some(self.bos_id);
        bpe_encode(text, &self.vocab, &self.scores, &self.vocab_map, bos)
    }

    /// Control tokens decode to nothing, and the piece right after BOS
    /// loses the dummy-prefix space the encoder put there.
    fn decode(&self, tokens: &[i32]) -> Result<String> {
        let mut bytes = Vec::with_capacity(tokens.len() * 4);
        let mut after_bos = false;
        for &token in tokens {
            let mut piece = self.piece(token).ok_or(PredictError::InvalidToken(token))?;
            if token == self.bos_id || token == self.eos_id || token == UNK_ID {
                after_bos = token == self.bos_id;
                continue;
            }
            if std::mem::take(&mut after_bos) {
                piece = piece.strip_prefix(' ').unwrap_or(piece);
            }
            match byte_token(piece) {
                Some(b) => bytes.push(b),
                None => bytes.extend_from_slice(piece.as_bytes()),
            }
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Parse a `<0xXX>` byte token.
fn byte_token(piece: &str) -> Option<u8> {
    let hex = piece.strip_prefix("<0x")?.strip_suffix('>')?;
    if hex.len() != 2 {
        return None;
    }
    u8::from_str_radix(hex, 16).ok()
}

/// Load a llama2.c tokenizer file sized by the model config.
pub fn load_tokenizer<P: AsRef<Path>>(path: P, config: &ModelConfig) -> Result<Tokenizer> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let _max_token_len = reader.read_u32::<LittleEndian>()?;

    let vocab_size = config.vocab_size;
    let mut vocab = Vec::with_capacity(vocab_size);
    let mut scores = Vec::with_capacity(vocab_size);

    for i in 0..vocab_size {
        let score = reader.read_f32::<LittleEndian>()?;
        scores.push(score);

        let len = reader.read_i32::<LittleEndian>()?;
        let len = usize::try_from(len)
            .map_err(|_| PredictError::Tokenizer(format!("negative length for token {i}")))?;
        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf)?;

        vocab.push(String::from_utf8_lossy(&buf).into_owned());
    }

    for id in [config.bos_token_id, config.eos_token_id] {
        if usize::try_from(id).map_or(true, |i| i >= vocab_size) {
            return Err(PredictError::Tokenizer(format!(
                "special token {id} is outside the vocabulary"
            )));
        }
    }

    Ok(Tokenizer::new(
        vocab,
        scores,
        config.bos_token_id,
        config.eos_token_id,
    ))
}

/// BPE encode text, merging the highest-scoring adjacent pair until none remain.
pub fn bpe_encode(
    text: &str,
    vocab: &[String],
    scores: &[f32],
    vocab_map: &HashMap<String, i32>,
    bos: Option<i32>,
) -> Result<Vec<i32>> {
    let mut tokens: Vec<i32> = Vec::with_capacity(text.len() + 2);

    if let Some(bos) = bos {
        tokens.push(bos);
    }

    // Dummy prefix space (llama tokenizer behavior)
    if !text.is_empty() {
        let dummy_prefix = vocab_map.get(" ").ok_or_else(|| {
            PredictError::Tokenizer("dummy prefix ' ' not found in vocabulary".into())
        })?;
        tokens.push(*dummy_prefix);
    }

    let mut buf = [0u8; 4];
    for c in text.chars() {
        let char_str: &str = c.encode_utf8(&mut buf);
        if let Some(&id) = vocab_map.get(char_str) {
            tokens.push(id);
            continue;
        }
        // Byte-level fallback
        for &b in char_str.as_bytes() {
            let id = b as i32 + BYTE_TOKEN_OFFSET;
            if id as usize >= vocab.len() {
                return Err(PredictError::Tokenizer(format!(
                    "no byte token for 0x{b:02X}"
                )));
            }
            tokens.push(id);
        }
    }

    // A leading BOS never merges
    let start = usize::from(bos.is_some());
    loop {
        let mut best_score = f32::NEG_INFINITY;
        let mut best: Option<(usize, i32)> = None;

        for i in start..tokens.len().saturating_sub(1) {
            let merged = format!(
                "{}{}",
                vocab[tokens[i] as usize],
                vocab[tokens[i + 1] as usize]
            );
            if let Some(&id) = vocab_map.get(&merged) {
                if scores[id as usize] > best_score {
                    best_score = scores[id as usize];
                    best = Some((i, id));
                }
            }
        }

        let Some((idx, id)) = best else { break };
        tokens[idx] = id;
        tokens.remove(idx + 1);
    }

    Ok(tokens)
}
