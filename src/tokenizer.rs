//! Text to token id conversion
//!
//! The acoustic model only needs a sequence of vocabulary ids. Anything that
//! can produce one implements [`TextTokenizer`]; the default implementation
//! wraps a Hugging Face `tokenizer.json`.

use crate::tts::TtsError;
use std::path::Path;
use tokenizers::Tokenizer;
use tracing::debug;

/// Longest token sequence passed to the model.
pub const MAX_TOKENS: usize = 128;

pub trait TextTokenizer: Send + Sync {
    /// Token ids for `text`, at most [`MAX_TOKENS`] long.
    fn encode(&self, text: &str) -> Result<Vec<u32>, TtsError>;
}

/// Tokenizer loaded from a `tokenizer.json` definition
pub struct HfTokenizer {
    inner: Tokenizer,
    max_tokens: usize,
}

impl HfTokenizer {
    pub fn from_file(path: &Path) -> Result<Self, TtsError> {
        let inner = Tokenizer::from_file(path)
            .map_err(|e| TtsError::Tokenizer(format!("failed to load {}: {e}", path.display())))?;
        Ok(Self {
            inner,
            max_tokens: MAX_TOKENS,
        })
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

impl TextTokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>, TtsError> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| TtsError::Tokenizer(format!("tokenization error: {e}")))?;
        let mut ids = encoding.get_ids().to_vec();
        if ids.len() > self.max_tokens {
            debug!("Truncating {} tokens to {}", ids.len(), self.max_tokens);
            ids.truncate(self.max_tokens);
        }
        Ok(ids)
    }
}
