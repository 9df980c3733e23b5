//! HTTP boundary: the chat endpoint and the usage side channel.

use crate::error::RelayError;
use crate::provider::{CompletionOptions, Message, Provider, ToolChoice};
use crate::relay::{ChatSession, Orchestrator};
use crate::usage::{UsageSnapshot, UsageStore};
use axum::{
    body::Body,
    extract::State,
    http::header::CONTENT_TYPE,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_stream::StreamExt;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub provider: Arc<dyn Provider>,
    pub orchestrator: Orchestrator,
    pub usage: Arc<UsageStore>,
    /// Options every chat request starts from.
    pub defaults: CompletionOptions,
}

impl AppState {
    pub fn new(provider: Arc<dyn Provider>, usage: Arc<UsageStore>, defaults: CompletionOptions) -> Self {
        Self {
            orchestrator: Orchestrator::new(provider.clone(), usage.clone()),
            provider,
            usage,
            defaults,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
pub struct TokensResponse {
    pub headers: HashMap<String, String>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/chat", post(chat))
        .route("/api/tokens", post(tokens))
        .route("/api/usage", get(usage))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Streams one logical answer, however many segments it takes.
///
/// A failure before the first chunk becomes an error status; later failures
/// cut the body short.
async fn chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Response, RelayError> {
    let options = CompletionOptions {
        tool_choice: ToolChoice::None,
        ..state.defaults.clone()
    };

    let ChatSession { mut output, driver } =
        state.orchestrator.start(req.messages, options).await?;

    tokio::spawn(async move {
        match driver.await {
            Ok(Ok(outcome)) => tracing::info!(
                segments = outcome.segments,
                switches = outcome.switches,
                finish_reason = ?outcome.finish_reason,
                "chat response complete"
            ),
            Ok(Err(RelayError::Cancelled)) => tracing::debug!("chat client went away"),
            Ok(Err(e)) => tracing::error!(error = %e, "chat response ended abnormally"),
            Err(e) => tracing::error!(error = %e, "chat driver task failed"),
        }
    });

    // Hold the status until the answer has either produced content or failed.
    let first = match output.next().await {
        Some(Err(e)) => return Err(e),
        first => first,
    };

    let stitched = tokio_stream::iter(first).chain(output);
    let body = Body::from_stream(stitched.map(|item| item.map(|chunk| chunk.text)));
    Ok(([(CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response())
}

async fn tokens(State(state): State<AppState>) -> Result<Json<TokensResponse>, RelayError> {
    let headers = state.provider.fetch_rate_limits(&state.defaults.model).await?;
    // Invalid snapshots are logged by the store; the raw headers are still returned.
    let _ = state.usage.publish(&headers);
    Ok(Json(TokensResponse { headers }))
}

async fn usage(State(state): State<AppState>) -> Json<Option<UsageSnapshot>> {
    Json(state.usage.current())
}
