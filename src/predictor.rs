//! Predictor: checkpoint setup plus the two generation entry points.

use crate::config::{GenerationSettings, ModelConfig};
use crate::decode::{Generation, StopParams, generate_to_eos};
use crate::engine::Generator;
use crate::error::{PredictError, Result};
use crate::files::ModelFiles;
use crate::model::load_model;
use crate::sample::SamplerParams;
use crate::session::LlamaSession;
use crate::tokenizer::{Codec, Tokenizer, load_tokenizer};
use crate::weights::LlamaWeights;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use tracing::{info, warn};

/// A loaded model, its tokenizer and the settings every call runs with.
///
/// Calls take `&mut self`: one predictor serves one request at a time.
pub struct Predictor {
    session: LlamaSession,
    tokenizer: Tokenizer,
    settings: GenerationSettings,
}

impl Predictor {
    /// Load everything from a checkpoint directory.
    pub fn setup<P: AsRef<Path>>(model_dir: P, settings: GenerationSettings) -> Result<Self> {
        settings.validate()?;
        let files = ModelFiles::discover(&model_dir)?;

        info!(path = %files.config.display(), "loading config");
        let config = ModelConfig::from_file(&files.config)?;
        info!(
            dim = config.hidden_size,
            layers = config.num_hidden_layers,
            heads = config.num_attention_heads,
            vocab = config.vocab_size,
            "model config"
        );

        info!(path = %files.tokenizer.display(), "loading tokenizer");
        let tokenizer = load_tokenizer(&files.tokenizer, &config)?;

        let weights_path = files
            .primary_weights()
            .ok_or_else(|| PredictError::MissingFile {
                what: "weight file (*.bin)",
                dir: model_dir.as_ref().to_path_buf(),
            })?;
        if files.weights.len() > 1 {
            warn!(
                count = files.weights.len(),
                "several weight files found, using the first"
            );
        }
        info!(path = %weights_path.display(), "loading model");
        let weights = load_model(weights_path, &config)?;

        Self::from_parts(config, weights, tokenizer, settings)
    }

    /// Assemble a predictor from an already loaded model.
    pub fn from_parts(
        config: ModelConfig,
        weights: LlamaWeights,
        tokenizer: Tokenizer,
        settings: GenerationSettings,
    ) -> Result<Self> {
        settings.validate()?;
        if tokenizer.vocab.len() != config.vocab_size {
            return Err(PredictError::Tokenizer(format!(
                "tokenizer has {} tokens, model expects {}",
                tokenizer.vocab.len(),
                config.vocab_size
            )));
        }
        if settings.typical > 0.0 {
            warn!(
                typical = settings.typical,
                "typical sampling is not supported, setting ignored"
            );
        }

        let mut session = LlamaSession::new(
            config,
            weights,
            SamplerParams::from(&settings),
            settings.seed,
        );
        if settings.ban_eos {
            session.disallow_tokens(&[tokenizer.eos_id]);
        }

        Ok(Predictor {
            session,
            tokenizer,
            settings,
        })
    }

    pub fn settings(&self) -> &GenerationSettings {
        &self.settings
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn session(&self) -> &LlamaSession {
        &self.session
    }

    /// Continue `prompt` for up to `max_new_tokens`, ending early on EOS.
    ///
    /// Returns the text of the whole sequence, prompt included.
    pub fn predict(&mut self, prompt: &str) -> Result<String> {
        if prompt.is_empty() {
            return Err(PredictError::EmptyPrompt);
        }
        let ids = self.tokenizer.encode(prompt, true)?;
        self.session.reseed(self.settings.seed);
        let generated = self.session.generate_simple(
            &ids,
            self.settings.max_new_tokens,
            self.tokenizer.eos_id,
        )?;
        info!(prompt_tokens = ids.len(), generated, "predict finished");

        self.tokenizer.decode(self.session.sequence())
    }

    /// Generate until EOS, the configured stop literal or the token budget.
    ///
    /// Returns the generated text only.
    pub fn generate_to_eos(&mut self, prompt: &str) -> Result<String> {
        Ok(self.generate(prompt, None)?.text)
    }

    /// [`Self::generate_to_eos`] with a flag that stops the loop between tokens.
    pub fn generate_to_eos_with_cancel(
        &mut self,
        prompt: &str,
        cancel: &AtomicBool,
    ) -> Result<Generation> {
        self.generate(prompt, Some(cancel))
    }

    fn generate(&mut self, prompt: &str, cancel: Option<&AtomicBool>) -> Result<Generation> {
        let params = StopParams {
            stop_token: self.tokenizer.eos_id,
            newline_token: self.tokenizer.newline_id()?,
            stop_text: &self.settings.stop_text,
            max_tokens: self.settings.max_new_tokens,
            cancel,
        };
        self.session.reseed(self.settings.seed);
        let generation = generate_to_eos(&mut self.session, &self.tokenizer, prompt, &params)?;
        info!(
            prompt_tokens = generation.prompt_tokens,
            iterations = generation.iterations,
            reason = %generation.stop_reason,
            "generate_to_eos finished"
        );
        Ok(generation)
    }
}
