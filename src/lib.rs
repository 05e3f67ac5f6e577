//! lm-serve: an HTTP text-completion service for fine-tuned GPT-2 checkpoints
//!
//! This library provides:
//! - Checkpoint and tokenizer loading (local directory or Hugging Face Hub)
//! - A GPT-2 decoder running on candle (CPU, CUDA or Metal)
//! - A configurable decoding policy (greedy, top-k sampling, beam search,
//!   beam sampling, n-gram repetition blocking)
//! - An axum server exposing `/generate` and `/chat/`
//!
//! # Example
//!
//! ```no_run
//! use clap::Parser;
//! use lm_serve::{server, ServeArgs, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let args = ServeArgs::parse_from(["lm-serve", "--checkpoint", "chatbot_model/checkpoint-3499"]);
//!     server::serve(args).await
//! }
//! ```

pub mod checkpoint;
pub mod config;
pub mod decoding;
pub mod engine;
pub mod error;
pub mod gpt2;
pub mod server;
pub mod tokenizer;

// Re-export main types for library users
pub use config::{DeviceChoice, ModelArgs, RouteProfile, RouteTable, ServeArgs};
pub use decoding::{CausalLm, DecodingPolicy, Strategy};
pub use engine::{Completion, EchoStrip, Engine};
pub use error::ServeError;
pub use server::{create_router, AppState};
pub use tokenizer::TextCodec;

// Re-export common types
pub type Result<T> = std::result::Result<T, anyhow::Error>;
