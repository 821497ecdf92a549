//! HTTP request handlers.

use crate::server::AppState;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use gateway_core::{Command, CommandResult, GatewayError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Body of `POST /api/v1/node/command`.
#[derive(Debug, Serialize, Deserialize)]
pub struct CommandRequest {
    pub tokens: Vec<String>,
    /// Per-reply timeout; the node's configured result timeout if omitted.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Collect every reply until the engine marks the command complete.
    #[serde(default)]
    pub resumable: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CommandResponse {
    pub id: String,
    pub code: i32,
    pub tokens: Vec<String>,
}

impl From<CommandResult> for CommandResponse {
    fn from(result: CommandResult) -> Self {
        Self {
            id: result.id.to_string(),
            code: result.code,
            tokens: result.tokens,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResumableResponse {
    pub id: String,
    pub replies: Vec<CommandResponse>,
}

/// JSON body of every failed request.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub node_inaccessible: bool,
}

/// Error rendered as a JSON body with a matching status code.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Gateway(GatewayError),
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        ApiError::Gateway(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, inaccessible) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message, false),
            ApiError::Gateway(err) => {
                let status = StatusCode::from_u16(err.http_status())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                let inaccessible = err.is_node_inaccessible();
                let message = if inaccessible {
                    format!("Node is inaccessible: {}", err)
                } else {
                    err.to_string()
                };
                (status, message, inaccessible)
            }
        };

        if status.is_server_error() {
            warn!("Request failed ({}): {}", status, message);
        }
        let body = ErrorBody {
            error: message,
            node_inaccessible: inaccessible,
        };
        (status, Json(body)).into_response()
    }
}

/// Health check endpoint.
pub async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let engine = state
        .supervisor
        .as_ref()
        .map(|supervisor| supervisor.state().to_string());
    Json(json!({
        "status": "ok",
        "communicating": state.node.is_communicating(),
        "pending": state.node.pending(),
        "engine": engine,
    }))
}

/// Run one command against the engine.
pub async fn handle_command(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CommandRequest>,
) -> Result<Response, ApiError> {
    if request.tokens.is_empty() {
        return Err(ApiError::BadRequest("tokens must not be empty".to_string()));
    }

    let cmd = if request.resumable {
        Command::resumable(request.tokens)
    } else {
        Command::new(request.tokens)
    };
    if let Err(index) = cmd.validate() {
        return Err(ApiError::BadRequest(format!(
            "token {} contains a tab or line break",
            index
        )));
    }

    if let Some(supervisor) = &state.supervisor {
        supervisor.ensure_available()?;
    }
    if !state.node.is_communicating() {
        return Err(GatewayError::NotCommunicating.into());
    }

    let timeout = request
        .timeout_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| state.node.settings().result_timeout());
    debug!("Executing command {} ({} tokens)", cmd.id(), cmd.body().len());

    if cmd.is_resumable() {
        let replies = state.node.collect_resumable(&cmd, timeout).await?;
        let response = ResumableResponse {
            id: cmd.id().to_string(),
            replies: replies.into_iter().map(CommandResponse::from).collect(),
        };
        return Ok(Json(response).into_response());
    }

    let result = state.node.execute(&cmd, timeout).await?;
    Ok(Json(CommandResponse::from(result)).into_response())
}
