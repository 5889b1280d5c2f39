// src/handlers/attempts.rs

use axum::{Json, extract::State, response::IntoResponse};
use serde_json::json;

use crate::{error::AppError, state::AppState};

/// Attempt history for the signed-in learner, or the guest history.
/// Each entry carries a `status` of `synced`, `pending` or `local`.
pub async fn list_attempts(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let session = state.auth.current_session().await;
    let history = state.submitter.history(session.as_ref()).await;
    Ok(Json(history))
}

/// The signed-in learner's attempts waiting to be synced.
pub async fn list_pending(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let session = state.auth.current_session().await;
    let pending = state.submitter.pending(session.as_ref()).await;
    let attempts: Vec<_> = pending.into_iter().map(|p| p.attempt).collect();

    Ok(Json(json!({
        "has_pending": state.submitter.has_pending(session.as_ref()).await,
        "attempts": attempts,
    })))
}

/// Pushes queued attempts to the backend now.
pub async fn resync(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let session = state.auth.current_session().await;
    let report = state.submitter.resync(session.as_ref()).await?;
    Ok(Json(report))
}
