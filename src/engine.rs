use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::RouteProfile;
use crate::decoding::{self, CausalLm};
use crate::error::ServeError;
use crate::tokenizer::TextCodec;

/// How the echoed prompt is removed from the model output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum EchoStrip {
    /// Decode only the tokens generated after the prompt, then trim.
    #[default]
    TokenOffset,
    /// Decode everything and keep the text after the first `marker`.
    /// Without a marker the full decoded text is returned unmodified.
    Marker(String),
    /// Return the full decoded text.
    None,
}

/// Text after the first occurrence of `marker`, trimmed.
pub fn text_after_marker<'a>(decoded: &'a str, marker: &str) -> Option<&'a str> {
    decoded.split_once(marker).map(|(_, rest)| rest.trim())
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
}

/// Tokenizer and model, loaded once and shared read-only by every request.
pub struct Engine {
    codec: TextCodec,
    model: Box<dyn CausalLm>,
    seed: Option<u64>,
    device: String,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("model", &self.model.name())
            .field("device", &self.device)
            .field("seed", &self.seed)
            .finish()
    }
}

impl Engine {
    pub fn new(codec: TextCodec, model: Box<dyn CausalLm>) -> Self {
        Self {
            codec,
            model,
            seed: None,
            device: "cpu".to_string(),
        }
    }

    /// With a seed every request samples from the same RNG stream, so
    /// identical input yields identical output.
    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_device_label(mut self, device: impl Into<String>) -> Self {
        self.device = device.into();
        self
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    pub fn device_label(&self) -> &str {
        &self.device
    }

    pub fn codec(&self) -> &TextCodec {
        &self.codec
    }

    fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }

    /// Prompt tokens a request may keep: the profile bound, and one less than
    /// the model context so a token can still be generated.
    fn input_budget(&self, profile: &RouteProfile) -> usize {
        let context = self.model.max_positions().saturating_sub(1).max(1);
        profile.max_input_tokens.map_or(context, |max| max.min(context))
    }

    /// Runs one request through `profile`. Blocking; call from a blocking
    /// thread.
    pub fn complete(&self, profile: &RouteProfile, input: &str) -> Result<Completion, ServeError> {
        let prompt = profile.render(input);
        let mut encoded = self.codec.encode(&prompt, None)?;

        let budget = self.input_budget(profile);
        if encoded.len() > budget {
            // Cut the user text, not the trailing cue the model answers to.
            let cue = self.codec.encode(profile.cue(), None)?.len().min(budget);
            tracing::debug!(original = encoded.len(), kept = budget, "Truncating prompt");
            encoded.keep_ends(budget - cue, cue);
        }

        if encoded.ids.is_empty() {
            // The model needs at least one position; start from EOS like an
            // unconditional GPT-2 sample.
            let seed_token = self.codec.eos_token_id().unwrap_or(0);
            encoded.ids.push(seed_token);
            encoded.attention_mask.push(1);
        }

        let mut rng = self.rng();
        let generated = decoding::generate(
            self.model.as_ref(),
            &encoded.ids,
            &encoded.attention_mask,
            &profile.policy,
            self.codec.eos_token_id(),
            &mut rng,
        )?;

        let text = match &profile.echo {
            EchoStrip::TokenOffset => self.codec.decode(generated.continuation())?.trim().to_string(),
            EchoStrip::Marker(marker) => {
                let decoded = self.codec.decode(&generated.tokens)?;
                match text_after_marker(&decoded, marker) {
                    Some(rest) => rest.to_string(),
                    None => {
                        tracing::warn!(
                            marker = %marker,
                            "Marker missing from decoded text, returning it unmodified"
                        );
                        decoded
                    }
                }
            }
            EchoStrip::None => self.codec.decode(&generated.tokens)?,
        };

        Ok(Completion {
            text,
            prompt_tokens: generated.prompt_len,
            generated_tokens: generated.continuation().len(),
        })
    }
}
