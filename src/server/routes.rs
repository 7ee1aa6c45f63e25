// src/server/routes.rs
//! Axum router and handlers for the peer endpoint

use crate::build::{BuildResult, ResultKind};
use crate::daemon::{Command, CommandOutput};
use crate::federation::protocol::{
    Advertisement, BuildRequest, BuildResponse, CancelRequest, EncodedFile, TOKEN_HEADER,
};
use crate::server::ServerState;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use std::sync::Arc;

pub type SharedState = Arc<ServerState>;

/// Create the peer endpoint router
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/v1/status", get(status))
        .route("/v1/builds", post(build))
        .route("/v1/builds/cancel", post(cancel))
        .route("/v1/submissions/cancel", post(cancel_submission))
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}

/// Reject requests without the configured token
fn authorize(state: &ServerState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = &state.token else {
        return Ok(());
    };
    let given = headers.get(TOKEN_HEADER).and_then(|v| v.to_str().ok());
    if given == Some(expected.as_str()) {
        Ok(())
    } else {
        tracing::warn!("[server] request without a valid token refused");
        Err((StatusCode::UNAUTHORIZED, "missing or wrong token").into_response())
    }
}

async fn status(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    if let Err(refused) = authorize(&state, &headers) {
        return refused;
    }
    let advertisement: Advertisement = state.daemon.advertisement();
    Json(advertisement).into_response()
}

async fn build(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(request): Json<BuildRequest>,
) -> Response {
    if let Err(refused) = authorize(&state, &headers) {
        return refused;
    }

    // run detached so a dropped connection cannot strand a leased session
    let daemon = state.daemon.clone();
    let result = match tokio::spawn(async move { daemon.serve_build(request).await }).await {
        Ok(result) => result,
        Err(e) => {
            tracing::error!("[server] peer build crashed: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "builder crashed").into_response();
        }
    };

    match result.kind {
        ResultKind::NoCapacity => (StatusCode::SERVICE_UNAVAILABLE, result.detail).into_response(),
        ResultKind::Refused => (StatusCode::UNPROCESSABLE_ENTITY, result.detail).into_response(),
        _ => Json(encode(result)).into_response(),
    }
}

/// Ship artifacts inline; an unreadable artifact fails the job
fn encode(result: BuildResult) -> BuildResponse {
    let mut artifacts = Vec::with_capacity(result.artifacts.len());
    for path in &result.artifacts {
        match EncodedFile::read(path) {
            Ok(file) => artifacts.push(file),
            Err(e) => {
                return BuildResponse {
                    kind: ResultKind::Failed,
                    detail: format!("cannot ship artifact: {}", e),
                    log: result.log,
                    artifacts: Vec::new(),
                };
            }
        }
    }
    BuildResponse {
        kind: result.kind,
        detail: result.detail,
        log: result.log,
        artifacts,
    }
}

async fn cancel(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(request): Json<CancelRequest>,
) -> Response {
    if let Err(refused) = authorize(&state, &headers) {
        return refused;
    }
    if state.daemon.cancel_inbound(&request.request_id) {
        StatusCode::OK.into_response()
    } else {
        (StatusCode::NOT_FOUND, "no such build").into_response()
    }
}

/// Operator cancellation of a local submission
#[derive(Debug, Deserialize)]
pub struct CancelSubmission {
    /// `<package>_<version>`
    pub key: String,
}

async fn cancel_submission(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(request): Json<CancelSubmission>,
) -> Response {
    if let Err(refused) = authorize(&state, &headers) {
        return refused;
    }
    match state.daemon.execute(Command::Cancel { key: request.key }, None).await {
        Ok(output @ CommandOutput::Cancelled { submission: Some(_), .. }) => {
            Json(output).into_response()
        }
        Ok(_) => (StatusCode::NOT_FOUND, "not building").into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}
