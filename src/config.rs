use clap::{Args, Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;

use crate::decoding::DecodingPolicy;
use crate::engine::EchoStrip;
use crate::error::ServeError;

const INPUT_PLACEHOLDER: &str = "{input}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DeviceChoice {
    /// CUDA if available, then Metal, else CPU
    Auto,
    Cpu,
    Cuda,
    Metal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EchoMode {
    /// Decode only the tokens generated after the prompt
    TokenOffset,
    /// Keep the text after the first echo marker
    Marker,
    /// Return the full decoded text
    None,
}

/// Where the model and tokenizer come from.
#[derive(Debug, Clone, Args)]
pub struct ModelArgs {
    /// Checkpoint directory holding config.json and the weights
    #[arg(long, env = "LM_SERVE_CHECKPOINT", default_value = "chatbot_model/checkpoint-3499")]
    pub checkpoint: PathBuf,

    /// tokenizer.json, a directory containing one, or a Hugging Face repo id
    /// such as `gpt2`. Defaults to the checkpoint directory; Trainer
    /// checkpoints usually ship without a tokenizer, so pass `gpt2` then.
    #[arg(long, env = "LM_SERVE_TOKENIZER")]
    pub tokenizer: Option<String>,

    #[arg(long, env = "LM_SERVE_DEVICE", value_enum, default_value_t = DeviceChoice::Auto)]
    pub device: DeviceChoice,

    /// Fixed sampling seed; identical requests then get identical output
    #[arg(long, env = "LM_SERVE_SEED")]
    pub seed: Option<u64>,

    /// Hugging Face API token for hub tokenizers
    #[arg(long, env = "HF_TOKEN", hide_env_values = true)]
    pub hf_token: Option<String>,
}

/// Per-route overrides of the built-in profiles.
#[derive(Debug, Clone, Args)]
pub struct RouteArgs {
    #[arg(long, value_enum, default_value_t = EchoMode::TokenOffset)]
    pub generate_echo: EchoMode,

    #[arg(long, value_enum, default_value_t = EchoMode::TokenOffset)]
    pub chat_echo: EchoMode,

    /// Marker used by `--*-echo marker`
    #[arg(long, default_value = "Bot:")]
    pub echo_marker: String,

    /// Maximum total length for /generate (default 100)
    #[arg(long)]
    pub generate_max_length: Option<usize>,

    /// Maximum total length for /chat/ (default 50)
    #[arg(long)]
    pub chat_max_length: Option<usize>,

    /// Prompt template for /chat/; must contain `{input}`
    #[arg(long)]
    pub chat_template: Option<String>,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "lm-serve")]
#[command(about = "Serve text completions from a fine-tuned GPT-2 checkpoint")]
pub struct ServeArgs {
    #[arg(long, env = "LM_SERVE_HOST", default_value = "127.0.0.1")]
    pub host: String,

    #[arg(short, long, env = "LM_SERVE_PORT", default_value = "8000")]
    pub port: u16,

    /// Allowed CORS origins, comma separated; empty or `*` allows any origin
    #[arg(long, env = "LM_SERVE_ALLOWED_ORIGINS", value_delimiter = ',')]
    pub allowed_origins: Vec<String>,

    #[command(flatten)]
    pub model: ModelArgs,

    #[command(flatten)]
    pub routes: RouteArgs,
}

/// Everything one route needs to turn user text into a completion.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteProfile {
    /// Template with an `{input}` placeholder.
    pub template: String,
    /// Prompt tokens kept; longer prompts lose user text but keep the
    /// template's trailing cue. `None` is bounded only by the model context.
    pub max_input_tokens: Option<usize>,
    pub policy: DecodingPolicy,
    pub echo: EchoStrip,
}

impl RouteProfile {
    /// `/generate`: raw prompt, 512 input tokens, 5-beam sampling to 100.
    pub fn generate() -> Self {
        Self {
            template: INPUT_PLACEHOLDER.to_string(),
            max_input_tokens: Some(512),
            policy: DecodingPolicy::beam_sample(100),
            echo: EchoStrip::TokenOffset,
        }
    }

    /// `/chat/`: `User:`/`Bot:` framing, greedy to 50.
    pub fn chat() -> Self {
        Self {
            template: "User: {input}\nBot:".to_string(),
            max_input_tokens: None,
            policy: DecodingPolicy::greedy(50),
            echo: EchoStrip::TokenOffset,
        }
    }

    pub fn render(&self, input: &str) -> String {
        self.template.replace(INPUT_PLACEHOLDER, input)
    }

    /// Template text after the last placeholder, e.g. `\nBot:` for chat.
    pub fn cue(&self) -> &str {
        self.template
            .rsplit_once(INPUT_PLACEHOLDER)
            .map_or("", |(_, cue)| cue)
    }

    pub fn validate(&self) -> Result<(), ServeError> {
        if !self.template.contains(INPUT_PLACEHOLDER) {
            return Err(ServeError::InvalidProfile(format!(
                "template {:?} has no {INPUT_PLACEHOLDER} placeholder",
                self.template
            )));
        }
        if self.max_input_tokens == Some(0) {
            return Err(ServeError::InvalidProfile("max_input_tokens must be at least 1".into()));
        }
        self.policy.validate()
    }
}

/// Profiles for every route, shared by the handlers.
#[derive(Debug, Clone)]
pub struct RouteTable {
    pub generate: Arc<RouteProfile>,
    pub chat: Arc<RouteProfile>,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self {
            generate: Arc::new(RouteProfile::generate()),
            chat: Arc::new(RouteProfile::chat()),
        }
    }
}

impl RouteTable {
    pub fn new(generate: RouteProfile, chat: RouteProfile) -> Result<Self, ServeError> {
        generate.validate()?;
        chat.validate()?;
        Ok(Self {
            generate: Arc::new(generate),
            chat: Arc::new(chat),
        })
    }
}

fn echo_strip(mode: EchoMode, marker: &str) -> EchoStrip {
    match mode {
        EchoMode::TokenOffset => EchoStrip::TokenOffset,
        EchoMode::Marker => EchoStrip::Marker(marker.to_string()),
        EchoMode::None => EchoStrip::None,
    }
}

impl RouteArgs {
    pub fn route_table(&self) -> Result<RouteTable, ServeError> {
        let mut generate = RouteProfile::generate();
        generate.echo = echo_strip(self.generate_echo, &self.echo_marker);
        if let Some(max) = self.generate_max_length {
            generate.policy.max_length = max;
        }

        let mut chat = RouteProfile::chat();
        chat.echo = echo_strip(self.chat_echo, &self.echo_marker);
        if let Some(max) = self.chat_max_length {
            chat.policy.max_length = max;
        }
        if let Some(template) = &self.chat_template {
            chat.template = template.clone();
        }

        RouteTable::new(generate, chat)
    }
}
