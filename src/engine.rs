//! Inference engine seam
//!
//! The bridge never implements inference itself. It drives an engine
//! through [`InferenceEngine`], one token at a time, with a reset between
//! requests. Any llama.cpp binding (or anything else that can tokenize,
//! decode and sample) slots in behind this trait.
//!
//! ## Example
//!
//! ```rust
//! use llamabridge::engine::{generate, EchoEngine};
//!
//! let mut engine = EchoEngine::new();
//! let out = generate(&mut engine, "<|user|>\nhello world<|end|>\n<|assistant|>\n", 16, |_, _| {})
//!     .unwrap();
//! assert_eq!(out.tokens, 2);
//! ```

use std::cell::RefCell;
use std::collections::VecDeque;

use tracing::warn;

use crate::error::BridgeError;

/// Token identifier, matching the i32 convention of llama.cpp-family vocabularies.
pub type TokenId = i32;

/// The operations the bridge needs from an inference engine.
///
/// Calls follow a strict per-request shape: one `tokenize` + `decode` for the
/// prompt, then alternating `sample_next` / `decode` for each generated
/// token, then `reset_sequence` before the next request. Implementations may
/// rely on that ordering.
pub trait InferenceEngine {
    /// Convert text to the engine's token sequence.
    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, BridgeError>;

    /// Feed tokens into the engine's context.
    fn decode(&mut self, tokens: &[TokenId]) -> Result<(), BridgeError>;

    /// Sample the next token from the current context.
    fn sample_next(&mut self) -> TokenId;

    /// Whether `token` ends the generation.
    fn is_end_of_sequence(&self, token: TokenId) -> bool;

    /// Convert a single token back to its text fragment.
    fn detokenize(&self, token: TokenId) -> Result<String, BridgeError>;

    /// Clear per-sequence state (context, KV cache) so the next request
    /// starts from a clean slate.
    fn reset_sequence(&mut self);
}

/// Default prompt template, matching the Phi-style chat markup the original
/// deployment was tuned for.
pub fn build_prompt(system_prompt: &str, user_prompt: &str) -> String {
    if system_prompt.is_empty() {
        format!("<|user|>\n{user_prompt}<|end|>\n<|assistant|>\n")
    } else {
        format!(
            "<|system|>\n{system_prompt}<|end|>\n<|user|>\n{user_prompt}<|end|>\n<|assistant|>\n"
        )
    }
}

/// Result of one generation run.
#[derive(Debug, Clone)]
pub struct Generation {
    /// Full generated text (possibly partial if the engine faulted mid-run).
    pub text: String,
    /// Number of tokens reflected in `text`.
    pub tokens: usize,
}

/// Drive `engine` through one generation.
///
/// `on_token` is invoked after every sampled token with the cumulative text
/// and the token count so far; whole-mode callers pass a no-op, streaming
/// callers publish from it. `max_tokens == 0` means unlimited.
///
/// Prompt-stage failures (tokenize or the initial decode) are returned as
/// errors. Failures after the first token are recovered locally: the loop
/// stops and whatever text was produced stands as the result, so the caller
/// can still complete the protocol.
pub fn generate<E, F>(
    engine: &mut E,
    prompt: &str,
    max_tokens: usize,
    mut on_token: F,
) -> Result<Generation, BridgeError>
where
    E: InferenceEngine + ?Sized,
    F: FnMut(&str, usize),
{
    let prompt_tokens = engine.tokenize(prompt)?;
    engine.decode(&prompt_tokens)?;

    let limit = if max_tokens == 0 {
        usize::MAX
    } else {
        max_tokens
    };

    let mut text = String::new();
    let mut produced = 0usize;

    while produced < limit {
        let token = engine.sample_next();
        if engine.is_end_of_sequence(token) {
            break;
        }

        let piece = match engine.detokenize(token) {
            Ok(piece) => piece,
            Err(e) => {
                warn!("detokenize failed after {produced} tokens: {e}");
                break;
            }
        };
        text.push_str(&piece);
        produced += 1;
        on_token(&text, produced);

        if let Err(e) = engine.decode(&[token]) {
            warn!("decode failed after {produced} tokens: {e}");
            break;
        }
    }

    Ok(Generation {
        text,
        tokens: produced,
    })
}

/// Deterministic reference engine: echoes the prompt's words back.
///
/// Carries no model. It exists so the binary and the tests can exercise the
/// full transport without a model file; real deployments implement
/// [`InferenceEngine`] over their inference backend instead.
pub struct EchoEngine {
    // Interior mutability because tokenize/detokenize are &self, matching
    // the const-ness of real tokenizer APIs.
    vocab: RefCell<Vec<String>>,
    pending: VecDeque<TokenId>,
    primed: bool,
}

impl EchoEngine {
    /// Reserved id for end-of-sequence; word ids start at 1.
    pub const EOS: TokenId = 0;

    pub fn new() -> Self {
        Self {
            vocab: RefCell::new(vec![String::new()]),
            pending: VecDeque::new(),
            primed: false,
        }
    }

    fn intern(&self, piece: &str) -> TokenId {
        let mut vocab = self.vocab.borrow_mut();
        if let Some(id) = vocab.iter().position(|v| v.as_str() == piece) {
            return id as TokenId;
        }
        vocab.push(piece.to_string());
        (vocab.len() - 1) as TokenId
    }
}

impl Default for EchoEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceEngine for EchoEngine {
    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, BridgeError> {
        // Chat template markers behave like special tokens: they shape the
        // prompt but never produce text.
        let mut cleaned = text.to_string();
        for marker in ["<|system|>", "<|user|>", "<|assistant|>", "<|end|>"] {
            cleaned = cleaned.replace(marker, " ");
        }
        Ok(cleaned
            .split_whitespace()
            .map(|piece| self.intern(piece))
            .collect())
    }

    fn decode(&mut self, tokens: &[TokenId]) -> Result<(), BridgeError> {
        // The first decode of a request is the prompt; it primes the echo.
        // Later single-token decodes are the sampled tokens being fed back.
        if !self.primed {
            self.pending = tokens.iter().copied().collect();
            self.primed = true;
        }
        Ok(())
    }

    fn sample_next(&mut self) -> TokenId {
        self.pending.pop_front().unwrap_or(Self::EOS)
    }

    fn is_end_of_sequence(&self, token: TokenId) -> bool {
        token == Self::EOS
    }

    fn detokenize(&self, token: TokenId) -> Result<String, BridgeError> {
        let vocab = self.vocab.borrow();
        let piece = vocab
            .get(token as usize)
            .ok_or_else(|| BridgeError::Generation(format!("unknown token id {token}")))?;
        Ok(format!("{piece} "))
    }

    fn reset_sequence(&mut self) {
        self.pending.clear();
        self.primed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_round_trips_words() {
        let mut engine = EchoEngine::new();
        let out = generate(&mut engine, "hello brave world", 0, |_, _| {}).unwrap();
        assert_eq!(out.text.trim(), "hello brave world");
        assert_eq!(out.tokens, 3);
    }

    #[test]
    fn echo_skips_template_markers() {
        let mut engine = EchoEngine::new();
        let prompt = build_prompt("You are terse.", "Say hi.");
        let out = generate(&mut engine, &prompt, 0, |_, _| {}).unwrap();
        assert!(!out.text.contains("<|"));
        assert!(out.text.contains("Say"));
    }

    #[test]
    fn max_tokens_caps_generation() {
        let mut engine = EchoEngine::new();
        let out = generate(&mut engine, "one two three four five six", 2, |_, _| {}).unwrap();
        assert_eq!(out.tokens, 2);
        assert_eq!(out.text.trim(), "one two");
    }

    #[test]
    fn callback_sees_cumulative_text() {
        let mut engine = EchoEngine::new();
        let mut seen = Vec::new();
        generate(&mut engine, "a b c", 0, |text, n| {
            seen.push((text.to_string(), n));
        })
        .unwrap();

        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].1, 1);
        assert_eq!(seen[2].1, 3);
        assert!(seen[2].0.starts_with(&seen[1].0));
        assert!(seen[1].0.starts_with(&seen[0].0));
    }

    #[test]
    fn reset_allows_reuse() {
        let mut engine = EchoEngine::new();
        let first = generate(&mut engine, "first run", 0, |_, _| {}).unwrap();
        engine.reset_sequence();
        let second = generate(&mut engine, "second go now", 0, |_, _| {}).unwrap();

        assert_eq!(first.tokens, 2);
        assert_eq!(second.tokens, 3);
        assert_eq!(second.text.trim(), "second go now");
    }

    #[test]
    fn empty_system_prompt_uses_short_template() {
        let prompt = build_prompt("", "question");
        assert!(prompt.starts_with("<|user|>"));
        assert!(!prompt.contains("<|system|>"));
    }
}
