// src/handlers/catalog.rs

use axum::{
    Json,
    extract::{Path, Query, State},
    response::IntoResponse,
};

use crate::{
    error::AppError,
    models::test::{TestListParams, TestSummary},
    state::AppState,
};

/// Lists live tests, newest first. Works offline from the cache.
pub async fn list_tests(
    State(state): State<AppState>,
    Query(params): Query<TestListParams>,
) -> Result<impl IntoResponse, AppError> {
    let tests = state.catalog.list(params.track).await?;
    let summaries: Vec<TestSummary> = tests.iter().map(TestSummary::from).collect();
    Ok(Json(summaries))
}

/// Returns a test summary; questions are only served through a quiz session.
pub async fn get_test(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let test = state.catalog.get(&id).await?;
    Ok(Json(TestSummary::from(&test)))
}
