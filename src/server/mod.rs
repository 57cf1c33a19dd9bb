//! HTTP surface
//!
//! Maps the operator-facing endpoints onto the validator, the command
//! queue, and the monitor's query interface. All bodies are JSON.

pub mod validate;

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use fimtrack_core::events::FileEvent;
use fimtrack_core::prelude::*;
use fimtrack_monitor::Monitor;

use crate::daemon::{self, Command, CommandQueue};
use self::validate::validate_and_sanitize;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub monitor: Arc<dyn Monitor>,
    pub queue: CommandQueue,
}

#[derive(Deserialize)]
struct CommandRequest {
    command: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/events", get(retrieve_events))
        .route("/command", post(receive_command))
        .route("/execute", post(execute_command))
        .fallback(not_found)
        .with_state(state)
}

/// Bind and serve until the cancellation token fires.
pub async fn serve(bind: &str, state: AppState, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("HTTP server listening on {}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("HTTP server stopped");
    Ok(())
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "alive and well" }))
}

async fn retrieve_events(
    State(state): State<AppState>,
) -> std::result::Result<Json<Vec<FileEvent>>, (StatusCode, Json<Value>)> {
    match state.monitor.file_events().await {
        Ok(events) => Ok(Json(events)),
        Err(e) => {
            error!("Failed to retrieve events: {}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            ))
        }
    }
}

/// Validate, sanitize, and enqueue for the daemon loop.
async fn receive_command(
    State(state): State<AppState>,
    payload: std::result::Result<Json<CommandRequest>, JsonRejection>,
) -> (StatusCode, Json<Value>) {
    let command = match parse_command(payload) {
        Ok(command) => command,
        Err(response) => return response,
    };

    match state.queue.try_enqueue(command) {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "command received" }))),
        Err(Error::QueueFull) => {
            warn!("Command queue full, rejecting command");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": "command queue full" })),
            )
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

/// Validate, sanitize, and run synchronously, returning captured output.
async fn execute_command(
    payload: std::result::Result<Json<CommandRequest>, JsonRejection>,
) -> (StatusCode, Json<Value>) {
    let command = match parse_command(payload) {
        Ok(command) => command,
        Err(response) => return response,
    };

    match daemon::execute_command(&command).await {
        Ok(output) => (
            StatusCode::OK,
            Json(json!({ "status": "command received", "output": output })),
        ),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

async fn not_found() -> (StatusCode, Json<Value>) {
    (StatusCode::NOT_FOUND, Json(json!({ "status": "not found" })))
}

/// Shared request plumbing: body rejection and validation both map to 400
/// with a reason string; a subprocess is only ever built from the
/// sanitized vector.
fn parse_command(
    payload: std::result::Result<Json<CommandRequest>, JsonRejection>,
) -> std::result::Result<Command, (StatusCode, Json<Value>)> {
    let Json(request) = payload.map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": e.body_text() })),
        )
    })?;

    let tokens = validate_and_sanitize(&request.command).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": e.to_string() })),
        )
    })?;

    Ok(Command {
        name: tokens[0].clone(),
        args: tokens[1..].to_vec(),
    })
}
