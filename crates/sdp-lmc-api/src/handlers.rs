//! REST API handlers.
//!
//! Device calls block (a command waits for its reconciliation pass), so
//! every handler that touches the device runs it on the blocking pool.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use sdp_lmc::{AttributeError, AttributeValue, CommandError, Device, DeviceKind, Reason};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

/// Run a blocking device call off the async runtime.
async fn blocking<T, F>(f: F) -> Result<T, Response>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        error!(error = %e, "device call aborted");
        error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
    })
}

// ── Device ─────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct DeviceInfo {
    pub name: String,
    pub kind: DeviceKind,
    pub version: String,
    pub commands: Vec<String>,
}

/// GET /api/v1/device
pub async fn get_device(State(state): State<ApiState>) -> Response {
    let device = &state.device;
    ApiResponse::ok(DeviceInfo {
        name: device.name().to_string(),
        kind: device.kind(),
        version: device.version().to_string(),
        commands: device.commands().iter().map(|c| c.to_string()).collect(),
    })
    .into_response()
}

// ── Attributes ─────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct AttributeEntry {
    pub name: &'static str,
    pub value: AttributeValue,
}

/// GET /api/v1/attributes
pub async fn list_attributes(State(state): State<ApiState>) -> Response {
    let entries: Vec<AttributeEntry> = state
        .device
        .attributes()
        .into_iter()
        .map(|(name, value)| AttributeEntry { name, value })
        .collect();
    ApiResponse::ok(entries).into_response()
}

/// GET /api/v1/attributes/:name
pub async fn get_attribute(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    match state.device.attribute(&name) {
        Some(value) => ApiResponse::ok(value).into_response(),
        None => error_response(&format!("attribute {name} not found"), StatusCode::NOT_FOUND),
    }
}

/// Attribute write body.
#[derive(Debug, Deserialize)]
pub struct WriteRequest {
    pub value: String,
}

/// PUT /api/v1/attributes/:name
pub async fn write_attribute(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(req): Json<WriteRequest>,
) -> Response {
    match state.device.write_attribute(&name, &req.value) {
        Ok(()) => {
            info!(attribute = %name, value = %req.value, "attribute written");
            let value = state.device.attribute(&name);
            ApiResponse::ok(value).into_response()
        }
        Err(e) => {
            let status = match e {
                AttributeError::NotFound(_) => StatusCode::NOT_FOUND,
                AttributeError::ReadOnly(_) => StatusCode::METHOD_NOT_ALLOWED,
                AttributeError::InvalidValue { .. } => StatusCode::BAD_REQUEST,
            };
            error_response(&e.to_string(), status)
        }
    }
}

/// POST /api/v1/update_attributes
pub async fn update_attributes(State(state): State<ApiState>) -> Response {
    let device = state.device.clone();
    match blocking(move || device.update_attributes()).await {
        Ok(Ok(())) => ApiResponse::ok("updated").into_response(),
        Ok(Err(e)) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
        Err(resp) => resp,
    }
}

// ── Commands ───────────────────────────────────────────────────

/// Failure details returned alongside a failed command.
#[derive(Debug, Serialize)]
pub struct CommandFailure {
    pub reason: Reason,
    pub description: String,
    pub origin: String,
}

impl From<&CommandError> for CommandFailure {
    fn from(e: &CommandError) -> Self {
        Self {
            reason: e.reason(),
            description: e.description(),
            origin: e.origin().to_string(),
        }
    }
}

fn command_error_response(e: &CommandError) -> Response {
    let status = match e.reason() {
        Reason::CommandNotAllowed => StatusCode::CONFLICT,
        Reason::CommandFailed => StatusCode::BAD_REQUEST,
    };
    (
        status,
        Json(ApiResponse {
            success: false,
            data: Some(CommandFailure::from(e)),
            error: Some(e.description()),
        }),
    )
        .into_response()
}

/// POST /api/v1/commands/:name
pub async fn run_command(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    body: String,
) -> Response {
    if !state.device.commands().contains(&name.as_str()) {
        return error_response(&format!("command {name} not found"), StatusCode::NOT_FOUND);
    }
    let device = state.device.clone();
    let command = name.clone();
    let outcome = match blocking(move || device.command_inout(&command, &body)).await {
        Ok(outcome) => outcome,
        Err(resp) => return resp,
    };
    match outcome {
        Some(Ok(())) => ApiResponse::ok(name).into_response(),
        Some(Err(e)) => command_error_response(&e),
        None => error_response(&format!("command {name} not found"), StatusCode::NOT_FOUND),
    }
}
