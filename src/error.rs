use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

/// Errors raised while turning a request into a completion.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),

    #[error("invalid decoding policy: {0}")]
    InvalidPolicy(String),

    #[error("invalid route profile: {0}")]
    InvalidProfile(String),

    #[error("sequence of {len} tokens exceeds the model context of {max} positions")]
    ContextOverflow { len: usize, max: usize },

    #[error("generation task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl ServeError {
    pub fn tokenizer(err: impl std::fmt::Display) -> Self {
        Self::Tokenizer(err.to_string())
    }

    fn kind(&self) -> &'static str {
        match self {
            ServeError::Tokenizer(_) => "tokenizer_error",
            ServeError::Model(_) | ServeError::ContextOverflow { .. } => "model_error",
            ServeError::InvalidPolicy(_) | ServeError::InvalidProfile(_) => "configuration_error",
            ServeError::Join(_) => "internal_error",
        }
    }
}

impl IntoResponse for ServeError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self, "Completion failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({
                "error": {
                    "message": self.to_string(),
                    "type": self.kind(),
                }
            })),
        )
            .into_response()
    }
}
