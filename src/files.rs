//! Checkpoint directory layout.

use crate::error::{PredictError, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub const TOKENIZER_FILE: &str = "tokenizer.bin";
pub const CONFIG_FILE: &str = "config.json";
pub const WEIGHTS_EXTENSION: &str = "bin";

/// Paths of everything a predictor needs from a checkpoint directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFiles {
    pub tokenizer: PathBuf,
    pub config: PathBuf,
    /// Every `*.bin` file except the tokenizer, in lexical order
    pub weights: Vec<PathBuf>,
}

impl ModelFiles {
    /// Locate the tokenizer, config and weight files inside `dir`.
    pub fn discover<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let tokenizer = require(dir, TOKENIZER_FILE, "tokenizer file")?;
        let config = require(dir, CONFIG_FILE, "model config")?;

        let mut weights = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_file() || path == tokenizer {
                continue;
            }
            if path.extension().is_some_and(|ext| ext == WEIGHTS_EXTENSION) {
                weights.push(path);
            }
        }
        weights.sort();

        if weights.is_empty() {
            return Err(PredictError::MissingFile {
                what: "weight file (*.bin)",
                dir: dir.to_path_buf(),
            });
        }

        Ok(ModelFiles {
            tokenizer,
            config,
            weights,
        })
    }

    /// The weight file that gets loaded.
    pub fn primary_weights(&self) -> Option<&Path> {
        self.weights.first().map(PathBuf::as_path)
    }
}

fn require(dir: &Path, name: &str, what: &'static str) -> Result<PathBuf> {
    let path = dir.join(name);
    if path.is_file() {
        Ok(path)
    } else {
        Err(PredictError::MissingFile {
            what,
            dir: dir.to_path_buf(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_first_weight_file_and_skips_tokenizer() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["tokenizer.bin", "config.json", "b.bin", "a.bin", "notes.txt"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }

        let files = ModelFiles::discover(dir.path()).unwrap();
        assert_eq!(files.weights.len(), 2);
        assert_eq!(
            files.primary_weights(),
            Some(dir.path().join("a.bin").as_path())
        );
        assert_eq!(files.tokenizer, dir.path().join("tokenizer.bin"));
    }

    #[test]
    fn missing_weights_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("tokenizer.bin"), b"").unwrap();
        fs::write(dir.path().join("config.json"), b"{}").unwrap();

        let err = ModelFiles::discover(dir.path()).unwrap_err();
        assert!(matches!(
            err,
            PredictError::MissingFile {
                what: "weight file (*.bin)",
                ..
            }
        ));
    }

    #[test]
    fn no_primary_weights_without_weight_files() {
        let files = ModelFiles {
            tokenizer: PathBuf::from("tokenizer.bin"),
            config: PathBuf::from("config.json"),
            weights: Vec::new(),
        };
        assert_eq!(files.primary_weights(), None);
    }

    #[test]
    fn missing_config_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("tokenizer.bin"), b"").unwrap();

        let err = ModelFiles::discover(dir.path()).unwrap_err();
        assert!(err.to_string().contains("model config"));
    }
}
