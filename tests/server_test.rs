//! HTTP-level tests for the completion routes.
//!
//! The router is driven in-process with `tower::ServiceExt::oneshot`, backed
//! by the scripted bigram model and the word-level test tokenizer, so no
//! checkpoint or network access is needed.

mod common;

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use common::*;
use http_body_util::BodyExt;
use lm_serve::server::cors_layer;
use lm_serve::{create_router, AppState, CausalLm, EchoStrip, Engine, RouteProfile, RouteTable};
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;

fn router_with(model: impl CausalLm + 'static, routes: RouteTable) -> Router {
    let engine = Engine::new(codec(), Box::new(model)).with_seed(Some(7));
    let state = AppState {
        engine: Arc::new(engine),
        routes,
    };
    create_router(state, cors_layer(&[]).unwrap())
}

fn router() -> Router {
    router_with(BigramLm::chatty(), RouteTable::default())
}

fn post_json(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(app: Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

fn only_string_field<'a>(json: &'a Value, field: &str) -> &'a str {
    let obj = json.as_object().expect("json object");
    assert_eq!(obj.len(), 1, "unexpected fields in {json}");
    obj[field].as_str().expect("string field")
}

#[tokio::test]
async fn chat_returns_continuation_without_prompt() {
    let (status, json) = send(router(), post_json("/chat/", r#"{"user_input": "Hello"}"#)).await;
    assert_eq!(status, StatusCode::OK);

    let reply = only_string_field(&json, "bot_response");
    assert!(!reply.is_empty());
    assert!(!reply.starts_with("User: Hello"));
    assert_eq!(reply, "there friend");
}

#[tokio::test]
async fn generate_returns_one_string_field() {
    let (status, json) = send(router(), post_json("/generate", r#"{"prompt": "Hi"}"#)).await;
    assert_eq!(status, StatusCode::OK);
    only_string_field(&json, "response");
}

#[tokio::test]
async fn generate_with_marker_strip() {
    let generate = RouteProfile {
        echo: EchoStrip::Marker("Bot:".into()),
        policy: lm_serve::DecodingPolicy::greedy(100),
        ..RouteProfile::generate()
    };
    let routes = RouteTable::new(generate, RouteProfile::chat()).unwrap();

    let (status, json) = send(
        router_with(BigramLm::chatty(), routes.clone()),
        post_json("/generate", r#"{"prompt": "Hi"}"#),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(only_string_field(&json, "response"), "there friend");

    // No marker in the output: the decoded text comes back as is.
    let (_, json) = send(
        router_with(BigramLm::chatty(), routes),
        post_json("/generate", r#"{"prompt": "Hello"}"#),
    )
    .await;
    assert_eq!(only_string_field(&json, "response"), "Hello there friend");
}

#[tokio::test]
async fn greedy_chat_is_deterministic() {
    let app = router();
    let (_, first) = send(app.clone(), post_json("/chat/", r#"{"user_input": "Hello"}"#)).await;
    let (_, second) = send(app, post_json("/chat/", r#"{"user_input": "Hello"}"#)).await;
    assert_eq!(first, second);
}

#[tokio::test]
async fn empty_input_does_not_crash() {
    for (uri, body, field) in [
        ("/chat/", r#"{"user_input": ""}"#, "bot_response"),
        ("/generate", r#"{"prompt": ""}"#, "response"),
    ] {
        let (status, json) = send(router(), post_json(uri, body)).await;
        assert_eq!(status, StatusCode::OK, "{uri}");
        only_string_field(&json, field);
    }
}

#[tokio::test]
async fn output_respects_max_length() {
    let (status, json) = send(
        router_with(BigramLm::endless(), RouteTable::default()),
        post_json("/chat/", r#"{"user_input": "Hello"}"#),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let words = only_string_field(&json, "bot_response").split_whitespace().count();
    // 50 total tokens minus the 3-token prompt
    assert!(words <= 47, "{words} words");
}

#[tokio::test]
async fn input_longer_than_the_context_still_succeeds() {
    let long = vec!["Hello"; 70].join(" ");
    for (uri, field, body) in [
        ("/chat/", "bot_response", serde_json::json!({ "user_input": long })),
        ("/generate", "response", serde_json::json!({ "prompt": long })),
    ] {
        let (status, json) = send(router(), post_json(uri, &body.to_string())).await;
        assert_eq!(status, StatusCode::OK, "{uri}");
        only_string_field(&json, field);
    }
}

#[tokio::test]
async fn missing_field_is_a_validation_error() {
    let (status, _) = send(router(), post_json("/chat/", r#"{"prompt": "Hello"}"#)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = send(router(), post_json("/generate", r#"{"user_input": "Hello"}"#)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn malformed_json_is_rejected() {
    let (status, _) = send(router(), post_json("/generate", r#"{"prompt": "#)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn model_failure_is_a_server_error() {
    let (status, json) = send(
        router_with(BrokenLm, RouteTable::default()),
        post_json("/chat/", r#"{"user_input": "Hello"}"#),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json["error"]["type"], "model_error");
}

#[tokio::test]
async fn health_reports_the_model() {
    let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, json) = send(router(), req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["model"], "bigram");
    assert_eq!(json["device"], "cpu");
}

#[tokio::test]
async fn cors_allows_configured_origin() {
    let cors = cors_layer(&["http://localhost:5173".to_string()]).unwrap();
    let engine = Engine::new(codec(), Box::new(BigramLm::chatty()));
    let app = create_router(
        AppState {
            engine: Arc::new(engine),
            routes: RouteTable::default(),
        },
        cors,
    );

    let req = Request::builder()
        .method(Method::OPTIONS)
        .uri("/chat/")
        .header(header::ORIGIN, "http://localhost:5173")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(req).await.unwrap();
    assert_eq!(
        response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
        "http://localhost:5173"
    );
    assert_eq!(
        response.headers().get(header::ACCESS_CONTROL_ALLOW_CREDENTIALS).unwrap(),
        "true"
    );
}

#[tokio::test]
async fn any_origin_does_not_allow_credentials() {
    let req = Request::builder()
        .method(Method::OPTIONS)
        .uri("/generate")
        .header(header::ORIGIN, "http://example.com")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .body(Body::empty())
        .unwrap();
    let response = router().oneshot(req).await.unwrap();
    assert_eq!(response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "*");
    assert!(response.headers().get(header::ACCESS_CONTROL_ALLOW_CREDENTIALS).is_none());
}

#[test]
fn invalid_origin_is_a_startup_error() {
    assert!(cors_layer(&["bad\norigin".to_string()]).is_err());
}
