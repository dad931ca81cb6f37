use crate::error::{Result, SutError};
use std::path::Path;
use tokenizers::Tokenizer;

/// Text <-> token id conversion needed by the text-based remote protocols.
pub trait TokenCodec: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;
    fn decode(&self, ids: &[u32]) -> Result<String>;
    /// Looks up a single vocabulary entry, as streamed by text-generation servers.
    fn token_to_id(&self, token: &str) -> Option<u32>;
    fn eos_token(&self) -> &str;
}

pub struct HfTokenCodec {
    tokenizer: Tokenizer,
    eos_token: String,
}

impl HfTokenCodec {
    pub fn new(tokenizer: Tokenizer, eos_token: impl Into<String>) -> Self {
        Self {
            tokenizer,
            eos_token: eos_token.into(),
        }
    }

    pub fn from_file(path: impl AsRef<Path>, eos_token: impl Into<String>) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(path.as_ref()).map_err(|e| {
            SutError::Tokenizer(format!(
                "failed to load {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Ok(Self::new(tokenizer, eos_token))
    }
}

impl TokenCodec for HfTokenCodec {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self.tokenizer.encode(text, false)?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        Ok(self.tokenizer.decode(ids, false)?)
    }

    fn token_to_id(&self, token: &str) -> Option<u32> {
        self.tokenizer.token_to_id(token)
    }

    fn eos_token(&self) -> &str {
        &self.eos_token
    }
}
