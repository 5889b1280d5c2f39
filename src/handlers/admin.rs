// src/handlers/admin.rs

use axum::{
    Json,
    extract::{Extension, Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde_json::json;
use validator::Validate;

use crate::{
    error::AppError,
    models::{
        test::{SetLiveRequest, TestDefinition, TestSummary},
        user::AdminLoginRequest,
    },
    services::{
        cache::FLAG_ADMIN_LOGGED_IN,
        test_import::{parse_test_definition, validate_definition},
    },
    state::AppState,
    utils::{
        hash::verify_password,
        jwt::{ADMIN_ROLE, Claims, sign_jwt},
    },
};

/// Logs in to the admin panel.
///
/// Needs a reachable backend, since every admin action writes to it.
pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<AdminLoginRequest>,
) -> Result<impl IntoResponse, AppError> {
    if let Err(validation_errors) = payload.validate() {
        return Err(AppError::BadRequest(validation_errors.to_string()));
    }

    let (Some(username), Some(password_hash)) = (
        state.config.admin_username.as_deref(),
        state.config.admin_password_hash.as_deref(),
    ) else {
        return Err(AppError::Unavailable(
            "Admin access is not configured".to_string(),
        ));
    };

    if !state.backend.is_reachable().await {
        return Err(AppError::Offline(
            "The admin panel needs an internet connection.".to_string(),
        ));
    }

    let password_ok = verify_password(&payload.password, password_hash)?;
    if payload.username != username || !password_ok {
        tracing::warn!(username = %payload.username, "Admin login rejected");
        return Err(AppError::AuthError("Invalid username or password".to_string()));
    }

    let token = sign_jwt(
        username,
        ADMIN_ROLE,
        &state.config.jwt_secret,
        state.config.jwt_expiration,
    )?;
    state.cache.set_flag(FLAG_ADMIN_LOGGED_IN, "true").await;
    tracing::info!(username, "Admin logged in");

    Ok(Json(json!({
        "token": token,
        "type": "Bearer",
        "expires_in": state.config.jwt_expiration,
    })))
}

/// Ends the admin session; tokens issued before stop working.
pub async fn logout(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, AppError> {
    state.cache.clear_flag(FLAG_ADMIN_LOGGED_IN).await;
    tracing::info!(username = %claims.sub, "Admin logged out");
    Ok(StatusCode::NO_CONTENT)
}

/// Imports a test definition.
///
/// The body is the JSON document as uploaded; unknown fields are rejected
/// and all problems are reported together.
pub async fn create_test(
    State(state): State<AppState>,
    body: String,
) -> Result<impl IntoResponse, AppError> {
    let test = parse_test_definition(&body)?;
    state.catalog.create(&test).await?;

    Ok((StatusCode::CREATED, Json(TestSummary::from(&test))))
}

/// Replaces a test definition. The id in the path wins over the body.
pub async fn update_test(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(mut test): Json<TestDefinition>,
) -> Result<impl IntoResponse, AppError> {
    test.id = id;
    validate_definition(&test)?;
    state.catalog.update(&test).await?;

    Ok(Json(TestSummary::from(&test)))
}

pub async fn delete_test(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    state.catalog.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Shows or hides a test from learners.
pub async fn set_live(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<SetLiveRequest>,
) -> Result<impl IntoResponse, AppError> {
    state.catalog.set_live(&id, payload.is_live).await?;
    Ok(Json(json!({ "id": id, "is_live": payload.is_live })))
}
