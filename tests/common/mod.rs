#![allow(dead_code)]

use lm_serve::{CausalLm, ServeError, TextCodec};
use std::collections::HashMap;

pub const EOS: u32 = 0;
pub const USER: u32 = 2;
pub const BOT: u32 = 3;
pub const HELLO: u32 = 4;
pub const HI: u32 = 5;
pub const THERE: u32 = 6;
pub const FRIEND: u32 = 7;
pub const AGAIN: u32 = 8;
pub const AND: u32 = 9;
pub const MORE: u32 = 10;
pub const VOCAB: usize = 11;

/// Word-level vocabulary split on whitespace, so `User:` and `Bot:` are
/// single tokens and decoding joins words with spaces.
const TOKENIZER_JSON: &str = r#"{
    "version": "1.0",
    "truncation": null,
    "padding": null,
    "added_tokens": [
        {"id": 0, "content": "<|endoftext|>", "single_word": false, "lstrip": false,
         "rstrip": false, "normalized": false, "special": true}
    ],
    "normalizer": null,
    "pre_tokenizer": {"type": "WhitespaceSplit"},
    "post_processor": null,
    "decoder": null,
    "model": {
        "type": "WordLevel",
        "vocab": {
            "<|endoftext|>": 0, "<unk>": 1, "User:": 2, "Bot:": 3, "Hello": 4, "Hi": 5,
            "there": 6, "friend": 7, "again": 8, "and": 9, "more": 10
        },
        "unk_token": "<unk>"
    }
}"#;

pub fn codec() -> TextCodec {
    TextCodec::from_bytes(TOKENIZER_JSON.as_bytes(), None).expect("test tokenizer")
}

/// Next-token distribution keyed on the last token of each row.
pub struct BigramLm {
    table: HashMap<u32, Vec<(u32, f32)>>,
    fallback: Vec<(u32, f32)>,
}

impl BigramLm {
    pub fn new(fallback: &[(u32, f32)]) -> Self {
        Self {
            table: HashMap::new(),
            fallback: fallback.to_vec(),
        }
    }

    pub fn after(mut self, token: u32, next: &[(u32, f32)]) -> Self {
        self.table.insert(token, next.to_vec());
        self
    }

    /// `User: Hello Bot:` -> `there friend <eos>`, and `Hi` -> `Bot:`.
    pub fn chatty() -> Self {
        Self::new(&[(THERE, 0.6), (FRIEND, 0.3)])
            .after(HI, &[(BOT, 0.9), (THERE, 0.05)])
            .after(BOT, &[(THERE, 0.9), (AGAIN, 0.05)])
            .after(THERE, &[(FRIEND, 0.9), (MORE, 0.05)])
            .after(FRIEND, &[(EOS, 0.9), (AND, 0.05)])
    }

    /// Never emits EOS.
    pub fn endless() -> Self {
        Self::new(&[(THERE, 0.5), (FRIEND, 0.3), (AGAIN, 0.2)])
            .after(THERE, &[(THERE, 0.6), (FRIEND, 0.3), (MORE, 0.1)])
            .after(FRIEND, &[(THERE, 0.6), (AND, 0.3), (MORE, 0.1)])
    }

    fn row_logits(&self, row: &[u32]) -> Vec<f32> {
        let dist = row
            .last()
            .and_then(|t| self.table.get(t))
            .unwrap_or(&self.fallback);
        let mut logits = vec![-20.0; VOCAB];
        for &(token, p) in dist {
            logits[token as usize] = p.ln();
        }
        logits
    }
}

impl CausalLm for BigramLm {
    fn next_token_logits(
        &self,
        rows: &[Vec<u32>],
        _attention_mask: &[Vec<u32>],
    ) -> Result<Vec<Vec<f32>>, ServeError> {
        Ok(rows.iter().map(|row| self.row_logits(row)).collect())
    }

    fn max_positions(&self) -> usize {
        64
    }

    fn name(&self) -> &str {
        "bigram"
    }
}

/// Fails every forward pass.
pub struct BrokenLm;

impl CausalLm for BrokenLm {
    fn next_token_logits(
        &self,
        _rows: &[Vec<u32>],
        _attention_mask: &[Vec<u32>],
    ) -> Result<Vec<Vec<f32>>, ServeError> {
        Err(ServeError::Model(candle_core::Error::Msg("device out of memory".into())))
    }

    fn name(&self) -> &str {
        "broken"
    }
}
