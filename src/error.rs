//! Error types for the predictor.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PredictError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("missing {what} in {}", dir.display())]
    MissingFile { what: &'static str, dir: PathBuf },

    #[error("invalid config.json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid settings file: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid model file: {0}")]
    InvalidModel(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("context window of {limit} tokens exceeded")]
    ContextOverflow { limit: usize },

    #[error("token {0} is outside the vocabulary")]
    InvalidToken(i32),

    #[error("cannot rewind {requested} tokens from a sequence of {len}")]
    Rewind { requested: usize, len: usize },

    #[error("token sequence is empty")]
    EmptySequence,

    #[error("prompt is empty")]
    EmptyPrompt,

    #[error("token budget is zero, nothing would be generated")]
    EmptyBudget,
}

pub type Result<T> = std::result::Result<T, PredictError>;
