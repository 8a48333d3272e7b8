//! API and health handlers
//!
//! The body of `POST /api/v1` is either a `{"command": "<raw JSON-RPC>"}`
//! envelope or a bare JSON-RPC object. Raw command text is opaque to the
//! gateway: it is forwarded as-is, and rejection is reserved for bodies
//! where no correlation id can be extracted.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::Value;
use tracing::debug;

use crate::infrastructure::http::server::AppState;
use crate::infrastructure::http::types::{ApiError, ApiQuery, CommandEnvelope, HealthResponse};
use crate::infrastructure::mcp::Payload;

/// `POST /api/v1`
pub async fn handle_api(
    State(state): State<AppState>,
    Query(query): Query<ApiQuery>,
    body: Bytes,
) -> Response {
    match dispatch(&state, query, &body).await {
        Ok(value) => Json(value).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn dispatch(state: &AppState, query: ApiQuery, body: &[u8]) -> Result<Value, ApiError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|err| ApiError::bad_request(format!("body is not valid JSON: {err}")))?;

    if value.get("command").is_some() {
        let envelope: CommandEnvelope = serde_json::from_value(value)
            .map_err(|err| ApiError::bad_request(format!("invalid command envelope: {err}")))?;
        let server = resolve_server(state, envelope.server.or(query.server))?;
        debug!(server = %server, "dispatching raw command");
        let response = state
            .bridge
            .dispatch(&server, Payload::Raw(&envelope.command))
            .await?;
        return Ok(response);
    }

    if !value.is_object() {
        return Err(ApiError::bad_request(
            "body must be a JSON-RPC object or a command envelope",
        ));
    }
    let server = resolve_server(state, query.server)?;
    debug!(server = %server, "dispatching structured request");
    let response = state
        .bridge
        .dispatch(&server, Payload::Structured(&value))
        .await?;
    Ok(response)
}

fn resolve_server(state: &AppState, explicit: Option<String>) -> Result<String, ApiError> {
    explicit
        .or_else(|| state.default_server.as_deref().map(str::to_string))
        .ok_or_else(|| {
            ApiError::bad_request("no server named in request and no default configured")
        })
}

/// `GET /health` — gateway liveness, with informational server states.
pub async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        servers: state.bridge.supervisor().status(),
    })
}

/// `POST /api/v1/servers/:name/reset` — clear a crash-looped server.
pub async fn handle_reset(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.bridge.supervisor().reset(&name) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => ApiError::from(err).into_response(),
    }
}
