//! Llama text generation with stop-literal detection.
//!
//! Loads a small llama checkpoint and exposes `predict` and
//! `generate_to_eos`, the latter decoding token by token until the
//! end-of-sequence token, a stop literal or the token budget.

pub mod config;
pub mod decode;
pub mod engine;
pub mod error;
pub mod files;
pub mod model;
pub mod ops;
pub mod predictor;
pub mod sample;
pub mod session;
pub mod state;
pub mod tokenizer;
pub mod weights;

pub use config::{GenerationSettings, ModelConfig};
pub use decode::{Generation, StopParams, StopReason, generate_to_eos};
pub use engine::Generator;
pub use error::{PredictError, Result};
pub use files::ModelFiles;
pub use predictor::Predictor;
pub use session::LlamaSession;
pub use tokenizer::{Codec, Tokenizer, load_tokenizer};
