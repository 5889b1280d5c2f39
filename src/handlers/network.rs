// src/handlers/network.rs

use std::time::Duration;

use axum::{
    Json,
    extract::{Query, State},
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::json;

use crate::{error::AppError, state::AppState};

#[derive(Debug, Deserialize)]
pub struct NetworkReport {
    pub online: bool,
}

#[derive(Debug, Deserialize)]
pub struct ProbeParams {
    pub timeout_ms: Option<u64>,
}

/// Connectivity as last reported, and whether the signed-in learner has
/// attempts waiting to sync.
pub async fn get_status(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let session = state.auth.current_session().await;
    Ok(Json(json!({
        "online": state.network.is_online(),
        "has_pending": state.submitter.has_pending(session.as_ref()).await,
    })))
}

/// Reports a connectivity change seen by the client.
///
/// Going from offline to online wakes the reconnect watcher, which syncs
/// queued attempts in the background.
pub async fn report_status(
    State(state): State<AppState>,
    Json(report): Json<NetworkReport>,
) -> Result<impl IntoResponse, AppError> {
    let changed = state.network.report(report.online);

    Ok(Json(json!({
        "online": state.network.is_online(),
        "changed": changed,
    })))
}

/// Checks that the backend actually answers, within `timeout_ms`.
pub async fn probe(
    State(state): State<AppState>,
    Query(params): Query<ProbeParams>,
) -> Result<impl IntoResponse, AppError> {
    let timeout_ms = params.timeout_ms.unwrap_or(state.config.probe_timeout_ms);
    let reachable = state
        .network
        .check_reachable(Duration::from_millis(timeout_ms))
        .await;

    Ok(Json(json!({
        "reachable": reachable,
        "timeout_ms": timeout_ms,
    })))
}
