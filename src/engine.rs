//! The generation primitive the decode loop drives.

use crate::error::Result;

/// A live token sequence plus "sample the next token given the history".
///
/// [`LlamaSession`](crate::session::LlamaSession) is the in-process
/// implementation; anything else that can extend, patch and rewind a
/// sequence can stand in for it.
pub trait Generator {
    /// Start a fresh sequence from the given prompt tokens.
    fn begin(&mut self, tokens: &[i32]) -> Result<()>;

    /// Sample one token conditioned on the whole sequence and append it.
    fn next_token(&mut self) -> Result<i32>;

    /// The sequence as it stands, prompt included.
    fn sequence(&self) -> &[i32];

    /// Overwrite the most recently appended token.
    fn replace_last_token(&mut self, token: i32) -> Result<()>;

    /// Drop the last `n` tokens.
    fn rewind(&mut self, n: usize) -> Result<()>;
}
