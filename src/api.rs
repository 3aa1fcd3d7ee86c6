//! REST API for server mode
//!
//! Serves the status document clients poll and accepts pledge submissions.
//! Projects are addressed by their payment-URL path, so
//! `https://host/projects/roof` answers status at
//! `GET /projects/roof/status` and takes pledges at
//! `POST /projects/roof`.

use crate::backend::Backend;
use crate::error::{BackendError, VerificationError};
use crate::model::Pledge;
use crate::server_client::ProjectStatus;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Health check endpoint: GET /health
pub async fn get_health() -> &'static str {
    "ok"
}

/// Response to a pledge submission: POST /{project-path}
#[derive(Serialize, Deserialize)]
pub struct SubmitPledgeResponse {
    pub accepted: bool,
    pub pledge_hash: String,
}

#[derive(Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub fn rest_router(backend: Backend) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/{*path}", get(get_status).post(submit_pledge))
        .with_state(backend)
}

/// GET /{project-path}/status: the authoritative pledge list.
async fn get_status(
    State(backend): State<Backend>,
    Path(path): Path<String>,
) -> Result<Json<ProjectStatus>, (StatusCode, Json<ErrorResponse>)> {
    let Some(project_path) = path.trim_matches('/').strip_suffix("/status") else {
        return Err(not_found("status documents live at <project>/status"));
    };
    let Some(project) = backend.get_project_from_url(project_path) else {
        return Err(not_found("no such project"));
    };
    // The status snapshot comes off the engine thread; don't hold a
    // runtime worker hostage while it queues.
    let status = tokio::task::spawn_blocking(move || backend.project_status(&project))
        .await
        .map_err(|_| internal("status snapshot failed"))?;
    Ok(Json(status))
}

/// POST /{project-path}: the submission pipeline.
async fn submit_pledge(
    State(backend): State<Backend>,
    Path(path): Path<String>,
    Json(pledge): Json<Pledge>,
) -> Result<Json<SubmitPledgeResponse>, (StatusCode, Json<ErrorResponse>)> {
    let Some(project) = backend.get_project_from_url(path.trim_matches('/')) else {
        return Err(not_found("no such project"));
    };
    debug!(project = %project.title, "pledge submitted over HTTP");
    match backend.submit_pledge(project, pledge).await {
        Ok(pledge) => Ok(Json(SubmitPledgeResponse {
            accepted: true,
            pledge_hash: pledge.hash().to_hex(),
        })),
        Err(err) => Err(submission_error(err)),
    }
}

fn submission_error(err: BackendError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &err {
        BackendError::Verification(VerificationError::UnknownUtxo(_)) => StatusCode::GONE,
        BackendError::Verification(_) => StatusCode::BAD_REQUEST,
        BackendError::NoCapablePeers { .. }
        | BackendError::NoUtxoReplies
        | BackendError::Broadcast(_)
        | BackendError::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
        BackendError::UnknownProject => StatusCode::NOT_FOUND,
        BackendError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

fn not_found(msg: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse { error: msg.into() }),
    )
}

fn internal(msg: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse { error: msg.into() }),
    )
}
