//! Chat proxy HTTP server.
//!
//! Routes:
//! - `POST /chat` — run one chat turn against the session's agent
//! - `GET /healthz` — liveness probe
//! - `GET /sessions` — list active session ids
//! - `GET /sessions/{id}/messages` — conversation history
//! - `DELETE /sessions/{id}` — drop a session and its tool connection

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use tower_http::trace::TraceLayer;
use tracing::info;

use crate::AppState;
use crate::error::ProxyError;
use crate::llm::MessageRole;

/// Request body for the chat endpoint.
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    /// User query.
    pub query: String,
    /// Optional session ID (creates a new session if absent or unknown).
    #[serde(default)]
    pub session_id: Option<String>,
    /// Optional model override for this session's agent.
    #[serde(default)]
    pub model: Option<String>,
}

/// Response from the chat endpoint.
#[derive(Debug, Serialize)]
pub struct ChatResponse {
    /// Agent response text.
    pub response: String,
    /// Session ID for this conversation.
    pub session_id: String,
    /// Identifier of the session's tool-server connection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mcp_session_id: Option<String>,
}

/// Build the proxy router.
#[must_use]
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/chat", post(chat))
        .route("/healthz", get(healthz))
        .route("/sessions", get(list_sessions))
        .route("/sessions/{id}/messages", get(get_messages))
        .route("/sessions/{id}", axum::routing::delete(delete_session))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve the proxy until shutdown.
///
/// # Errors
///
/// Fails if the listener cannot bind or the server loop errors.
pub async fn start_server(state: AppState, addr: &str) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!(
        name: "server.started",
        address = %addr,
        "Chat proxy started"
    );

    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

/// POST /chat - run one chat turn.
async fn chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ProxyError> {
    tracing::info!(
        query_length = req.query.len(),
        session_id = ?req.session_id,
        model = ?req.model,
        "Received chat request"
    );

    // Credential check comes before any session work.
    if state.settings.api_key.is_none() {
        return Err(ProxyError::Configuration(
            "OPENAI_API_KEY is not set".to_string(),
        ));
    }

    let session = state.sessions.resolve(req.session_id.as_deref()).await?;

    let model = req.model.as_deref().unwrap_or(&state.settings.default_model);
    let agent = session
        .ensure_agent(state.driver.clone(), model, state.runtime.max_steps)
        .await;

    let response = tokio::time::timeout(
        state.runtime.turn_timeout,
        session.run_turn(&agent, &req.query),
    )
    .await
    .map_err(|_| ProxyError::Agent(anyhow::anyhow!("chat turn timed out")))??;

    Ok(Json(ChatResponse {
        response,
        session_id: session.id().to_string(),
        mcp_session_id: Some(session.mcp_session_id().to_string()),
    }))
}

/// GET /healthz - liveness probe.
async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// GET /sessions - list active session ids.
async fn list_sessions(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.sessions.list_ids())
}

/// Message DTO for history responses.
#[derive(Debug, Serialize)]
struct MessageDto {
    role: MessageRole,
    content: String,
}

/// GET /sessions/:id/messages - conversation history.
async fn get_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<MessageDto>>, ProxyError> {
    let session = state
        .sessions
        .get(&id)
        .ok_or_else(|| ProxyError::SessionNotFound(id))?;

    let messages = session
        .history()
        .into_iter()
        .map(|m| MessageDto {
            role: m.role,
            content: m.content,
        })
        .collect();
    Ok(Json(messages))
}

/// DELETE /sessions/:id - drop a session.
async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ProxyError> {
    match state.sessions.remove(&id) {
        Some(session) => {
            tracing::info!(session_id = %session.id(), "Session deleted");
            Ok(StatusCode::NO_CONTENT)
        }
        None => Err(ProxyError::SessionNotFound(id)),
    }
}
