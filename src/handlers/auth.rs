// src/handlers/auth.rs

use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde_json::json;
use validator::Validate;

use crate::{error::AppError, models::user::CredentialsRequest, state::AppState};

/// Registers a learner with the hosted auth service and signs them in.
///
/// Returns 201 Created and the user (never the tokens).
pub async fn sign_up(
    State(state): State<AppState>,
    Json(payload): Json<CredentialsRequest>,
) -> Result<impl IntoResponse, AppError> {
    if let Err(validation_errors) = payload.validate() {
        return Err(AppError::BadRequest(validation_errors.to_string()));
    }

    let user = state.auth.sign_up(&payload.email, &payload.password).await?;

    Ok((StatusCode::CREATED, Json(json!({ "user": user }))))
}

/// Signs a learner in.
///
/// Afterwards attempts are saved to the backend instead of guest history.
/// Anything queued while signed out of this account is synced right away.
pub async fn sign_in(
    State(state): State<AppState>,
    Json(payload): Json<CredentialsRequest>,
) -> Result<impl IntoResponse, AppError> {
    if let Err(validation_errors) = payload.validate() {
        return Err(AppError::BadRequest(validation_errors.to_string()));
    }

    let user = state.auth.sign_in(&payload.email, &payload.password).await?;

    let session = state.auth.current_session().await;
    if let Err(e) = state.submitter.resync(session.as_ref()).await {
        tracing::warn!("Resync after sign-in failed: {}", e);
    }

    Ok(Json(json!({
        "user": user,
        "has_pending": state.submitter.has_pending(session.as_ref()).await,
    })))
}

/// Signs out locally (and remotely when possible); resets the quiz session.
pub async fn sign_out(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    state.auth.sign_out().await;
    Ok(StatusCode::NO_CONTENT)
}

/// Returns the current learner, or `null` in guest mode.
pub async fn me(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let user = state.auth.verified_user().await?;
    let session = state.auth.current_session().await;

    Ok(Json(json!({
        "user": user,
        "guest": user.is_none(),
        "has_pending": state.submitter.has_pending(session.as_ref()).await,
    })))
}
