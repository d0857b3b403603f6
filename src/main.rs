use clap::{Parser, ValueEnum};
use llama_predict::{GenerationSettings, Predictor};
use std::io::{self, Read};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// Plain continuation, prints prompt and completion
    Predict,
    /// Stop on end-of-sequence or the stop literal, prints the completion
    Eos,
}

/// Run a llama checkpoint directory on a prompt.
#[derive(Debug, Parser)]
#[command(version)]
struct Cli {
    /// Directory holding tokenizer.bin, config.json and the *.bin weights
    model_dir: PathBuf,

    /// Prompt text, read from stdin when omitted
    prompt: Option<String>,

    #[arg(long, value_enum, default_value = "eos")]
    mode: Mode,

    /// TOML file with generation settings
    #[arg(long)]
    settings: Option<PathBuf>,

    #[arg(long)]
    max_new_tokens: Option<usize>,

    /// 0 = greedy
    #[arg(long)]
    temperature: Option<f32>,

    #[arg(long)]
    top_p: Option<f32>,

    #[arg(long)]
    top_k: Option<usize>,

    #[arg(long)]
    seed: Option<u64>,

    /// Stop literal for eos mode, empty disables it
    #[arg(long)]
    stop: Option<String>,

    /// Let the model end on its end-of-sequence token
    #[arg(long)]
    allow_eos: bool,
}

impl Cli {
    fn settings(&self) -> llama_predict::Result<GenerationSettings> {
        let mut settings = match &self.settings {
            Some(path) => GenerationSettings::from_toml_file(path)?,
            None => GenerationSettings::default(),
        };
        if let Some(v) = self.max_new_tokens {
            settings.max_new_tokens = v;
        }
        if let Some(v) = self.temperature {
            settings.temperature = v;
        }
        if let Some(v) = self.top_p {
            settings.top_p = v;
        }
        if let Some(v) = self.top_k {
            settings.top_k = v;
        }
        if let Some(v) = self.seed {
            settings.seed = v;
        }
        if let Some(v) = &self.stop {
            settings.stop_text = v.clone();
        }
        if self.allow_eos {
            settings.ban_eos = false;
        }
        Ok(settings)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = cli.settings()?;

    let prompt = match &cli.prompt {
        Some(p) => p.clone(),
        None => {
            let mut buf = String::new();
            io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };

    let mut predictor = Predictor::setup(&cli.model_dir, settings)?;
    let text = match cli.mode {
        Mode::Predict => predictor.predict(&prompt)?,
        Mode::Eos => predictor.generate_to_eos(&prompt)?,
    };
    println!("{text}");
    Ok(())
}
