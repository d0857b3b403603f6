//! Incremental decode loop with end-of-sequence and stop-literal detection.

use crate::engine::Generator;
use crate::error::{PredictError, Result};
use crate::tokenizer::Codec;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Stop conditions and budget for one call.
#[derive(Debug, Clone, Copy)]
pub struct StopParams<'a> {
    /// End-of-sequence token
    pub stop_token: i32,
    /// Substituted for `stop_token` when generation ends on it
    pub newline_token: i32,
    /// Case-insensitive literal; empty never matches
    pub stop_text: &'a str,
    pub max_tokens: usize,
    /// Checked once per iteration, before sampling
    pub cancel: Option<&'a AtomicBool>,
}

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Sampled the end-of-sequence token.
    StopToken,
    /// The decoded text ended with the stop literal.
    ///
    /// `rewind` tokens were taken off the sequence. `consistent` is false when
    /// those tokens are not exactly the literal, i.e. the isolated
    /// tokenization of the literal disagrees with how it was generated.
    StopText { rewind: usize, consistent: bool },
    /// Used up the token budget.
    MaxTokens,
    /// The cancel flag was raised.
    Cancelled,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::StopToken => write!(f, "eos"),
            StopReason::StopText { .. } => write!(f, "stop_text"),
            StopReason::MaxTokens => write!(f, "max_tokens"),
            StopReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Output of [`generate_to_eos`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    /// Text of the generated tokens only
    pub text: String,
    pub stop_reason: StopReason,
    /// Prompt length in tokens, BOS included
    pub prompt_tokens: usize,
    /// Decode iterations performed
    pub iterations: usize,
}

/// Generate from `prompt` until the stop token, the stop literal or the budget.
///
/// The returned text covers the generated suffix only. On the stop token the
/// final token is swapped for `newline_token`; on the stop literal the literal
/// stays in the returned text but its isolated token length is rewound from
/// the generator.
pub fn generate_to_eos<G, C>(
    generator: &mut G,
    codec: &C,
    prompt: &str,
    params: &StopParams<'_>,
) -> Result<Generation>
where
    G: Generator + ?Sized,
    C: Codec + ?Sized,
{
    if prompt.is_empty() {
        return Err(PredictError::EmptyPrompt);
    }
    if params.max_tokens == 0 {
        return Err(PredictError::EmptyBudget);
    }

    let ids = codec.encode(prompt, true)?;
    generator.begin(&ids)?;
    let prompt_tokens = ids.len();
    let stop_text = params.stop_text.to_lowercase();

    let mut generated = 0usize;
    let mut text = String::new();

    for iteration in 1..=params.max_tokens {
        if params.cancel.is_some_and(|c| c.load(Ordering::Relaxed)) {
            debug!(iteration, "generation cancelled");
            return Ok(Generation {
                text,
                stop_reason: StopReason::Cancelled,
                prompt_tokens,
                iterations: iteration - 1,
            });
        }

        let token = generator.next_token()?;

        if token == params.stop_token {
            generator.replace_last_token(params.newline_token)?;
            let text = decode_tail(generator, codec, generated + 1)?;
            debug!(iteration, "stopped on end-of-sequence token");
            return Ok(Generation {
                text,
                stop_reason: StopReason::StopToken,
                prompt_tokens,
                iterations: iteration,
            });
        }

        generated += 1;
        text = decode_tail(generator, codec, generated)?;

        if !stop_text.is_empty() && text.to_lowercase().ends_with(&stop_text) {
            let rewind = codec.encode(params.stop_text, false)?.len();
            let consistent = rewind <= generated
                && decode_tail(generator, codec, rewind)?.to_lowercase() == stop_text;
            if !consistent {
                warn!(
                    rewind,
                    generated,
                    stop_text = params.stop_text,
                    "stop literal tokenizes differently in isolation, rewind does not match the generated suffix"
                );
            }
            generator.rewind(rewind)?;
            debug!(iteration, rewind, "stopped on stop literal");
            return Ok(Generation {
                text,
                stop_reason: StopReason::StopText { rewind, consistent },
                prompt_tokens,
                iterations: iteration,
            });
        }
    }

    Ok(Generation {
        text,
        stop_reason: StopReason::MaxTokens,
        prompt_tokens,
        iterations: params.max_tokens,
    })
}

/// Decode the last `n` tokens of the generator's sequence.
fn decode_tail<G, C>(generator: &G, codec: &C, n: usize) -> Result<String>
where
    G: Generator + ?Sized,
    C: Codec + ?Sized,
{
    let seq = generator.sequence();
    let start = seq.len().checked_sub(n).ok_or(PredictError::Rewind {
        requested: n,
        len: seq.len(),
    })?;
    codec.decode(&seq[start..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Character vocabulary; index 0 is BOS and decodes to nothing.
    struct CharCodec {
        vocab: Vec<&'static str>,
    }

    const BOS: i32 = 0;
    const EOS: i32 = 1;
    const NEWLINE: i32 = 2;

    impl CharCodec {
        fn new() -> Self {
            let vocab = vec![
                "", "</s>", "\n", "#", "###", "4", " ", "Q", ":", "2", "+", "?", "A", "x", "S",
                "T", "O", "P", "s", "t", "o", "p",
            ];
            Self { vocab }
        }

        fn id(&self, piece: &str) -> i32 {
            self.vocab.iter().position(|p| *p == piece).unwrap() as i32
        }

        fn ids(&self, text: &str) -> Vec<i32> {
            text.chars().map(|c| self.id(&c.to_string())).collect()
        }
    }

    impl Codec for CharCodec {
        fn encode(&self, text: &str, bos: bool) -> Result<Vec<i32>> {
            let mut ids = Vec::new();
            if bos {
                ids.push(BOS);
            }
            for c in text.chars() {
                let id = self
                    .vocab
                    .iter()
                    .position(|p| *p == c.to_string())
                    .ok_or_else(|| PredictError::Tokenizer(format!("no token for {c:?}")))?;
                ids.push(id as i32);
            }
            Ok(ids)
        }

        fn decode(&self, tokens: &[i32]) -> Result<String> {
            tokens
                .iter()
                .map(|&t| {
                    self.vocab
                        .get(t as usize)
                        .copied()
                        .ok_or(PredictError::InvalidToken(t))
                })
                .collect()
        }
    }

    /// Replays a fixed list of tokens and records how it was driven.
    struct ScriptedGenerator {
        script: VecDeque<i32>,
        sequence: Vec<i32>,
        calls: usize,
        rewound: usize,
    }

    impl ScriptedGenerator {
        fn new(script: impl IntoIterator<Item = i32>) -> Self {
            Self {
                script: script.into_iter().collect(),
                sequence: Vec::new(),
                calls: 0,
                rewound: 0,
            }
        }
    }

    impl Generator for ScriptedGenerator {
        fn begin(&mut self, tokens: &[i32]) -> Result<()> {
            self.sequence = tokens.to_vec();
            Ok(())
        }

        fn next_token(&mut self) -> Result<i32> {
            self.calls += 1;
            let token = self.script.pop_front().unwrap_or(13);
            self.sequence.push(token);
            Ok(token)
        }

        fn sequence(&self) -> &[i32] {
            &self.sequence
        }

        fn replace_last_token(&mut self, token: i32) -> Result<()> {
            let last = self
                .sequence
                .last_mut()
                .ok_or(PredictError::EmptySequence)?;
            *last = token;
            Ok(())
        }

        fn rewind(&mut self, n: usize) -> Result<()> {
            let len = self.sequence.len();
            if n > len {
                return Err(PredictError::Rewind { requested: n, len });
            }
            self.sequence.truncate(len - n);
            self.rewound += n;
            Ok(())
        }
    }

    fn params(stop_text: &str, max_tokens: usize) -> StopParams<'_> {
        StopParams {
            stop_token: EOS,
            newline_token: NEWLINE,
            stop_text,
            max_tokens,
            cancel: None,
        }
    }

    #[test]
    fn stops_on_literal_and_rewinds_it() {
        let codec = CharCodec::new();
        let prompt = "Q: 2+2?\nA:";
        let script = codec.ids(" 4\n###xx");
        let mut generator = ScriptedGenerator::new(script);

        let out = generate_to_eos(&mut generator, &codec, prompt, &params("###", 50)).unwrap();

        assert_eq!(out.text, " 4\n###");
        assert_eq!(
            out.stop_reason,
            StopReason::StopText {
                rewind: 3,
                consistent: true
            }
        );
        assert_eq!(out.iterations, 6);
        assert_eq!(generator.calls, 6);
        // prompt plus " 4\n" survives, "###" is gone
        let expected_len = out.prompt_tokens + 3;
        assert_eq!(generator.sequence().len(), expected_len);
        assert_eq!(
            codec.decode(&generator.sequence()[out.prompt_tokens..]).unwrap(),
            " 4\n"
        );
    }

    #[test]
    fn literal_match_ignores_case() {
        let codec = CharCodec::new();
        let mut generator = ScriptedGenerator::new(codec.ids("xStOpx"));

        let out = generate_to_eos(&mut generator, &codec, "Q", &params("sToP", 10)).unwrap();
        assert_eq!(out.text, "xStOp");
        assert_eq!(
            out.stop_reason,
            StopReason::StopText {
                rewind: 4,
                consistent: true
            }
        );
    }

    #[test]
    fn stop_token_becomes_newline_and_halts() {
        let codec = CharCodec::new();
        let mut script = codec.ids(" 4");
        script.push(EOS);
        script.extend(codec.ids("###"));
        let mut generator = ScriptedGenerator::new(script);

        let out = generate_to_eos(&mut generator, &codec, "Q", &params("###", 50)).unwrap();

        assert_eq!(out.text, " 4\n");
        assert_eq!(out.stop_reason, StopReason::StopToken);
        assert_eq!(out.iterations, 3);
        assert_eq!(generator.calls, 3);
        assert_eq!(generator.sequence().last(), Some(&NEWLINE));
        assert_eq!(generator.rewound, 0);
    }

    #[test]
    fn stop_token_on_first_iteration_returns_newline() {
        let codec = CharCodec::new();
        let mut generator = ScriptedGenerator::new([EOS]);

        let out = generate_to_eos(&mut generator, &codec, "Q", &params("###", 1)).unwrap();
        assert_eq!(out.text, "\n");
        assert_eq!(out.stop_reason, StopReason::StopToken);
    }

    #[test]
    fn budget_bounds_iterations() {
        let codec = CharCodec::new();
        let mut generator = ScriptedGenerator::new(codec.ids("xxxxxxxxxx"));

        let out = generate_to_eos(&mut generator, &codec, "Q", &params("###", 4)).unwrap();
        assert_eq!(out.text, "xxxx");
        assert_eq!(out.stop_reason, StopReason::MaxTokens);
        assert_eq!(generator.calls, 4);
    }

    #[test]
    fn budget_of_one_returns_a_single_token() {
        let codec = CharCodec::new();
        let mut generator = ScriptedGenerator::new(codec.ids("4"));

        let out = generate_to_eos(&mut generator, &codec, "Q", &params("###", 1)).unwrap();
        assert_eq!(out.text, "4");
        assert_eq!(out.iterations, 1);
    }

    #[test]
    fn empty_literal_never_fires() {
        let codec = CharCodec::new();
        let mut generator = ScriptedGenerator::new(codec.ids("###"));

        let out = generate_to_eos(&mut generator, &codec, "Q", &params("", 3)).unwrap();
        assert_eq!(out.text, "###");
        assert_eq!(out.stop_reason, StopReason::MaxTokens);
    }

    #[test]
    fn zero_budget_and_empty_prompt_fail_fast() {
        let codec = CharCodec::new();
        let mut generator = ScriptedGenerator::new([]);

        let err = generate_to_eos(&mut generator, &codec, "Q", &params("###", 0)).unwrap_err();
        assert!(matches!(err, PredictError::EmptyBudget));
        let err = generate_to_eos(&mut generator, &codec, "", &params("###", 5)).unwrap_err();
        assert!(matches!(err, PredictError::EmptyPrompt));
        assert_eq!(generator.calls, 0);
    }

    #[test]
    fn llama_tokenizer_literal_rewinds_past_the_literal() {
        use crate::tokenizer::Tokenizer;
        use crate::tokenizer::tests::tiny_vocab;

        let (vocab, scores) = tiny_vocab();
        let codec = Tokenizer::new(vocab, scores, 1, 2);
        let newline = codec.newline_id().unwrap();
        let hashes = codec.vocab_map["###"];
        let mut generator = ScriptedGenerator::new([newline, hashes]);
        let stop = StopParams {
            stop_token: codec.eos_id,
            newline_token: newline,
            stop_text: "###",
            max_tokens: 10,
            cancel: None,
        };

        let out = generate_to_eos(&mut generator, &codec, "ab", &stop).unwrap();

        assert_eq!(out.text, "\n###");
        // the dummy prefix makes "###" two tokens in isolation, one more
        // than was generated for it
        assert_eq!(
            out.stop_reason,
            StopReason::StopText {
                rewind: 2,
                consistent: false
            }
        );
        assert_eq!(out.prompt_tokens, 3);
        assert_eq!(generator.sequence(), &[1, 266, 264]);
        assert_eq!(generator.rewound, 2);
    }

    #[test]
    fn mismatched_rewind_is_reported() {
        let codec = CharCodec::new();
        // "###" arrives as one token but re-tokenizes as three
        let mut script = codec.ids("44");
        script.push(codec.id("###"));
        let mut generator = ScriptedGenerator::new(script);

        let out = generate_to_eos(&mut generator, &codec, "Q", &params("###", 10)).unwrap();
        assert_eq!(out.text, "44###");
        assert_eq!(
            out.stop_reason,
            StopReason::StopText {
                rewind: 3,
                consistent: false
            }
        );
        // the isolated length is still what gets rewound
        assert_eq!(generator.rewound, 3);
        assert_eq!(generator.sequence().len(), out.prompt_tokens);
    }

    #[test]
    fn raised_cancel_flag_stops_before_sampling() {
        let codec = CharCodec::new();
        let cancel = AtomicBool::new(true);
        let mut generator = ScriptedGenerator::new(codec.ids("4444"));
        let stop = StopParams {
            cancel: Some(&cancel),
            ..params("###", 4)
        };

        let out = generate_to_eos(&mut generator, &codec, "Q", &stop).unwrap();
        assert_eq!(out.stop_reason, StopReason::Cancelled);
        assert_eq!(out.text, "");
        assert_eq!(generator.calls, 0);
    }

    #[test]
    fn identical_runs_give_identical_text() {
        let codec = CharCodec::new();
        let run = || {
            let mut generator = ScriptedGenerator::new(codec.ids("2+2?\n4"));
            generate_to_eos(&mut generator, &codec, "Q", &params("###", 8)).unwrap()
        };
        assert_eq!(run(), run());
    }
}
