// src/handlers/quiz.rs

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use crate::{
    error::AppError,
    models::test::TestSummary,
    services::{
        quiz_session::QuizSession,
        submission::SubmitOutcome,
    },
    state::AppState,
};

/// DTO for starting a quiz.
#[derive(Debug, Deserialize)]
pub struct StartQuizRequest {
    pub test_id: String,
}

/// DTO for answering the question with `question_id`.
/// `option` may be the English or the Hindi option text.
#[derive(Debug, Deserialize)]
pub struct AnswerRequest {
    pub question_id: String,
    pub option: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NavigateAction {
    Next,
    Previous,
    GoTo,
}

#[derive(Debug, Deserialize)]
pub struct NavigateRequest {
    pub action: NavigateAction,
    pub index: Option<usize>,
}

fn no_session() -> AppError {
    AppError::NotFound("No quiz in progress".to_string())
}

fn session_view(session: &QuizSession) -> serde_json::Value {
    let now = Utc::now();
    json!({
        "test": TestSummary::from(session.test()),
        "cursor": session.cursor(),
        "question_count": session.test().question_count(),
        "answered": session.answers().count(),
        "current": session.current_question(),
        "remaining_secs": session.remaining(now).num_seconds(),
        "expired": session.is_expired(now),
    })
}

/// Starts a new quiz on a test, discarding any quiz in progress.
pub async fn start_quiz(
    State(state): State<AppState>,
    Json(req): Json<StartQuizRequest>,
) -> Result<impl IntoResponse, AppError> {
    let test = state.catalog.get(&req.test_id).await?;
    let session = QuizSession::start(test, Utc::now())?;
    let view = session_view(&session);
    state.quiz.start(session).await;

    Ok((StatusCode::CREATED, Json(view)))
}

/// Returns the quiz in progress with the current question.
pub async fn get_quiz(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let guard = state.quiz.lock().await;
    let session = guard.as_ref().ok_or_else(no_session)?;
    Ok(Json(session_view(session)))
}

/// Records an answer. Answering the same question again replaces it.
pub async fn answer_question(
    State(state): State<AppState>,
    Json(req): Json<AnswerRequest>,
) -> Result<impl IntoResponse, AppError> {
    let mut guard = state.quiz.lock().await;
    let session = guard.as_mut().ok_or_else(no_session)?;

    if session.is_expired(Utc::now()) {
        return Err(AppError::BadRequest(
            "Time is up. Submit the test to see your score.".to_string(),
        ));
    }

    let answer = session.select_answer(&req.question_id, &req.option)?;
    Ok(Json(json!({
        "question_id": answer.question_id,
        "selected_option": answer.selected_option,
    })))
}

/// Removes the answer to a question.
pub async fn clear_answer(
    State(state): State<AppState>,
    Path(question_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let mut guard = state.quiz.lock().await;
    let session = guard.as_mut().ok_or_else(no_session)?;

    if !session.clear_answer(&question_id) {
        return Err(AppError::NotFound("Question has no answer".to_string()));
    }
    Ok(StatusCode::NO_CONTENT)
}

/// Moves between questions.
pub async fn navigate(
    State(state): State<AppState>,
    Json(req): Json<NavigateRequest>,
) -> Result<impl IntoResponse, AppError> {
    let mut guard = state.quiz.lock().await;
    let session = guard.as_mut().ok_or_else(no_session)?;

    match req.action {
        NavigateAction::Next => {
            session.next();
        }
        NavigateAction::Previous => {
            session.previous();
        }
        NavigateAction::GoTo => {
            let index = req
                .index
                .ok_or_else(|| AppError::BadRequest("index is required".to_string()))?;
            session.go_to(index)?;
        }
    }

    Ok(Json(session_view(session)))
}

/// Scores the quiz in progress and saves the attempt.
///
/// * Signed in and online: saved to the backend.
/// * Signed in and offline: queued locally, synced on reconnect.
/// * Guest: kept in local history only.
///
/// The session lock is released while saving so a repeated submit hits
/// the duplicate guard instead of waiting.
pub async fn submit_quiz(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let now = Utc::now();
    let (attempt, answers, summary) = {
        let guard = state.quiz.lock().await;
        let session = guard.as_ref().ok_or_else(no_session)?;
        let (attempt, answers) = session.finish(now);
        (attempt, answers, session.summary())
    };

    let auth_session = state.auth.current_session().await;
    let outcome = state
        .submitter
        .submit(attempt.clone(), &answers, auth_session.as_ref())
        .await?;

    if outcome != SubmitOutcome::InFlight {
        let mut guard = state.quiz.lock().await;
        let same_session = guard.as_ref().is_some_and(|s| s.attempt_id() == attempt.id);
        if same_session {
            *guard = None;
        }
    }

    Ok(Json(json!({
        "result": outcome,
        "attempt": attempt,
        "correct": summary.correct,
        "wrong": summary.wrong,
        "unanswered": summary.unanswered,
    })))
}
