use std::path::Path;
use tokenizers::Tokenizer;

use crate::error::ServeError;

/// End-of-sequence spellings tried when the checkpoint config names none.
const EOS_CANDIDATES: &[&str] = &["<|endoftext|>", "</s>", "<eos>"];

/// Token ids and attention mask for one prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    pub ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
}

impl Encoded {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Keeps the first `head` and last `tail` tokens, dropping the middle.
    pub fn keep_ends(&mut self, head: usize, tail: usize) {
        if head + tail >= self.ids.len() {
            return;
        }
        let tail_start = self.ids.len() - tail;
        self.ids.drain(head..tail_start);
        self.attention_mask.drain(head..tail_start);
    }
}

/// Tokenizer plus the special-token ids generation needs.
#[derive(Debug, Clone)]
pub struct TextCodec {
    inner: Tokenizer,
    eos_token_id: Option<u32>,
    pad_token_id: Option<u32>,
}

impl TextCodec {
    pub fn from_file(path: &Path, eos_hint: Option<u32>) -> Result<Self, ServeError> {
        let tokenizer = Tokenizer::from_file(path).map_err(ServeError::tokenizer)?;
        Ok(Self::new(tokenizer, eos_hint))
    }

    pub fn from_bytes(bytes: &[u8], eos_hint: Option<u32>) -> Result<Self, ServeError> {
        let tokenizer = Tokenizer::from_bytes(bytes).map_err(ServeError::tokenizer)?;
        Ok(Self::new(tokenizer, eos_hint))
    }

    /// `eos_hint` comes from the checkpoint's `config.json` and wins over
    /// vocabulary lookups.
    pub fn new(tokenizer: Tokenizer, eos_hint: Option<u32>) -> Self {
        let eos_token_id = eos_hint.or_else(|| {
            EOS_CANDIDATES
                .iter()
                .find_map(|tok| tokenizer.token_to_id(tok))
        });

        // GPT-2 ships without a pad token; pad with EOS instead.
        let pad_token_id = tokenizer
            .get_padding()
            .map(|p| p.pad_id)
            .or_else(|| tokenizer.token_to_id("<pad>"))
            .or(eos_token_id);

        tracing::debug!(
            eos_token_id = ?eos_token_id,
            pad_token_id = ?pad_token_id,
            vocab_size = tokenizer.get_vocab_size(true),
            "Tokenizer ready"
        );

        Self {
            inner: tokenizer,
            eos_token_id,
            pad_token_id,
        }
    }

    pub fn eos_token_id(&self) -> Option<u32> {
        self.eos_token_id
    }

    pub fn pad_token_id(&self) -> Option<u32> {
        self.pad_token_id
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    /// Encodes without special tokens, keeping at most the first
    /// `max_tokens` ids.
    pub fn encode(&self, text: &str, max_tokens: Option<usize>) -> Result<Encoded, ServeError> {
        let encoding = self.inner.encode(text, false).map_err(ServeError::tokenizer)?;
        let mut ids = encoding.get_ids().to_vec();
        let mut attention_mask = encoding.get_attention_mask().to_vec();

        if let Some(max) = max_tokens {
            if ids.len() > max {
                tracing::debug!(original = ids.len(), kept = max, "Truncating prompt");
                ids.truncate(max);
                attention_mask.truncate(max);
            }
        }

        Ok(Encoded {
            ids,
            attention_mask,
        })
    }

    pub fn decode(&self, ids: &[u32]) -> Result<String, ServeError> {
        self.inner.decode(ids, true).map_err(ServeError::tokenizer)
    }
}
