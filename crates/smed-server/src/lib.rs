// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! HTTP surface of the server.
//!
//! Thin axum handlers over the core: session CRUD, the prompt endpoint
//! that drives the processor, and `GET /event` — a Server-Sent-Events
//! stream that mirrors every bus event as a `{type, properties}` frame.
//! A disconnecting SSE client only unsubscribes itself.

mod error;
mod sse;

pub use error::ApiError;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::info;

use smed_bus::Bus;
use smed_core::{ProcessError, Processor, SessionStore};
use smed_model::{Message, Part, PermissionReply, Session};
use smed_permission::PermissionGate;

pub struct AppState {
    pub store: SessionStore,
    pub bus: Arc<Bus>,
    pub processor: Arc<Processor>,
    pub permission: Arc<dyn PermissionGate>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/session", post(create_session).get(list_sessions))
        .route("/session/:id", get(get_session).delete(delete_session))
        .route("/session/:id/prompt", post(prompt))
        .route("/session/:id/messages", get(list_messages))
        .route("/event", get(sse::events))
        .route("/permission/:id", post(respond_permission))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the listener fails.
pub async fn serve(addr: SocketAddr, state: Arc<AppState>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

// ── Request / response bodies ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateSessionBody {
    directory: String,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PromptBody {
    parts: Vec<PromptPart>,
    /// Per-prompt model override; the configured model applies when absent.
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    agent: Option<String>,
    /// Workspace directory for the run; moves the session when it differs.
    #[serde(default)]
    directory: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum PromptPart {
    Text { text: String },
}

#[derive(Debug, Serialize)]
struct MessageWithParts {
    #[serde(flatten)]
    message: Message,
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct PermissionBody {
    response: PermissionReply,
}

// ── Handlers ──────────────────────────────────────────────────────────────────

async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateSessionBody>,
) -> Result<Json<Session>, ApiError> {
    if body.directory.is_empty() {
        return Err(ApiError::invalid("directory must not be empty"));
    }
    let session = state.store.create_session(body.directory, body.title)?;
    Ok(Json(session))
}

async fn list_sessions(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Session>>, ApiError> {
    Ok(Json(state.store.list_sessions()?))
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Session>, ApiError> {
    Ok(Json(state.store.session(&id)?))
}

async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    // Fetch first so a missing id is a 404, not a silent no-op.
    let session = state.store.session(&id)?;
    state.store.delete_session(&session.id)?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

/// Append the user message and drive the run to completion; the response
/// is the final assistant message.  Streaming observers use `/event`.
async fn prompt(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<PromptBody>,
) -> Result<Json<MessageWithParts>, ApiError> {
    let text = body
        .parts
        .iter()
        .map(|PromptPart::Text { text }| text.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    if text.trim().is_empty() {
        return Err(ApiError::invalid("prompt must contain text"));
    }

    let mut session = state.store.session(&id)?;
    if let Some(directory) = &body.directory {
        if !directory.is_empty() && *directory != session.directory {
            session.directory = directory.clone();
            state.store.update_session(&session)?;
        }
    }
    state.store.title_from_prompt(&mut session, &text)?;
    state.store.create_user_message(&session.id, &text)?;

    let agent = body.agent.as_deref().unwrap_or("build");
    let message = state
        .processor
        .process_with_model(&session.id, agent, body.model.as_deref())
        .await?;
    let parts = state.store.parts(&message.id)?;
    Ok(Json(MessageWithParts { message, parts }))
}

async fn list_messages(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<MessageWithParts>>, ApiError> {
    // 404 for unknown sessions rather than an empty list.
    state.store.session(&id)?;
    let messages = state
        .store
        .messages_with_parts(&id)?
        .into_iter()
        .map(|(message, parts)| MessageWithParts { message, parts })
        .collect();
    Ok(Json(messages))
}

async fn respond_permission(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<PermissionBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !state.permission.respond(&id, body.response) {
        return Err(ApiError::not_found(format!(
            "no pending permission request: {id}"
        )));
    }
    Ok(Json(serde_json::json!({ "replied": true })))
}

// Referenced by ApiError to classify processor failures.
pub(crate) fn process_error_status(err: &ProcessError) -> axum::http::StatusCode {
    use axum::http::StatusCode;
    match err {
        ProcessError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        ProcessError::AlreadyProcessing(_) => StatusCode::CONFLICT,
        ProcessError::NotProcessing(_) => StatusCode::CONFLICT,
        ProcessError::Aborted => StatusCode::REQUEST_TIMEOUT,
        ProcessError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ProcessError::StepLimit(_) | ProcessError::OutputLength => StatusCode::UNPROCESSABLE_ENTITY,
        ProcessError::Provider(_) => StatusCode::BAD_GATEWAY,
        ProcessError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
