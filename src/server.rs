use anyhow::Context;
use axum::{
    extract::State,
    http::HeaderValue,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::checkpoint::load_engine;
use crate::config::{RouteProfile, RouteTable, ServeArgs};
use crate::engine::{Completion, Engine};
use crate::error::ServeError;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub routes: RouteTable,
}

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub response: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub user_input: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub bot_response: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub model: String,
    pub device: String,
}

/// Runs one completion on the blocking pool and logs its outcome.
async fn run_completion(
    state: &AppState,
    route: &'static str,
    profile: Arc<RouteProfile>,
    input: String,
) -> Result<Completion, ServeError> {
    let request_id = uuid::Uuid::new_v4();
    tracing::info!(
        route,
        request_id = %request_id,
        input_length = input.len(),
        "Received completion request"
    );
    tracing::trace!(request_id = %request_id, input = %input, "Request text");

    let engine = state.engine.clone();
    let started = Instant::now();
    let completion = tokio::task::spawn_blocking(move || engine.complete(&profile, &input))
        .await?
        .inspect_err(|e| {
            tracing::error!(route, request_id = %request_id, error = %e, "Generation failed");
        })?;

    tracing::info!(
        route,
        request_id = %request_id,
        prompt_tokens = completion.prompt_tokens,
        generated_tokens = completion.generated_tokens,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Completion finished"
    );
    tracing::trace!(request_id = %request_id, response = %completion.text, "Completion text");

    Ok(completion)
}

pub async fn generate(
    State(state): State<AppState>,
    Json(req): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, ServeError> {
    let profile = state.routes.generate.clone();
    let completion = run_completion(&state, "generate", profile, req.prompt).await?;
    Ok(Json(GenerateResponse {
        response: completion.text,
    }))
}

pub async fn chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ServeError> {
    let profile = state.routes.chat.clone();
    let completion = run_completion(&state, "chat", profile, req.user_input).await?;
    Ok(Json(ChatResponse {
        bot_response: completion.text,
    }))
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        model: state.engine.model_name().to_string(),
        device: state.engine.device_label().to_string(),
    })
}

/// Any origin when `origins` is empty or contains `*`, otherwise exactly
/// the listed ones with credentials allowed. All methods and headers are
/// accepted either way.
pub fn cors_layer(origins: &[String]) -> anyhow::Result<CorsLayer> {
    if origins.is_empty() || origins.iter().any(|o| o.trim() == "*") {
        return Ok(CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any));
    }
    let values = origins
        .iter()
        .map(|o| {
            HeaderValue::from_str(o.trim()).with_context(|| format!("Invalid CORS origin {o:?}"))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    // Credentials rule out wildcards, so methods and headers are mirrored.
    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(values))
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true))
}

pub fn create_router(state: AppState, cors: CorsLayer) -> Router {
    Router::new()
        .route("/generate", post(generate))
        .route("/chat/", post(chat))
        .route("/health", get(health))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received, draining in-flight requests");
}

/// Loads the engine, then serves until Ctrl-C or SIGTERM.
pub async fn serve(args: ServeArgs) -> crate::Result<()> {
    let routes = args.routes.route_table()?;
    let cors = cors_layer(&args.allowed_origins)?;

    let engine = Arc::new(load_engine(&args.model).await?);
    tracing::info!(
        model = engine.model_name(),
        device = engine.device_label(),
        "Engine ready"
    );

    let state = AppState {
        engine: engine.clone(),
        routes,
    };
    let app = create_router(state, cors);

    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    tracing::info!("Server listening on http://{}", addr);
    tracing::info!("Generate endpoint: http://{}/generate", addr);
    tracing::info!("Chat endpoint: http://{}/chat/", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    drop(engine);
    tracing::info!("Server stopped, model released");
    Ok(())
}
