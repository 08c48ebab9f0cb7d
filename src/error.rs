//! Error kinds surfaced by the chat proxy.
//!
//! Every failure is either recovered into a canned response (the agent's
//! step ceiling, handled in the session layer) or propagated once; there
//! are no retries anywhere in the proxy.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Failures surfaced by proxy request handling.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// A required credential or setting is missing. Surfaced before any
    /// session mutation.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Constructing the remote tool client failed; no session record was
    /// inserted.
    #[error("failed to connect to the tool server: {0}")]
    ConnectionSetup(#[source] anyhow::Error),

    /// The delegated agent run failed for a reason other than the step
    /// ceiling, which is recovered locally.
    #[error("agent run failed: {0}")]
    Agent(#[source] anyhow::Error),

    /// The referenced session does not exist.
    #[error("unknown session: {0}")]
    SessionNotFound(String),
}

impl ProxyError {
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Configuration(_) | Self::ConnectionSetup(_) | Self::Agent(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
