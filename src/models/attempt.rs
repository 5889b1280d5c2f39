// src/models/attempt.rs

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::test::ExamTrack;

/// The learner's choice for one question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserAnswer {
    pub question_id: String,
    pub selected_option: String,
    pub is_correct: bool,
    /// Either 0 or the question's full marks.
    pub marks_awarded: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionScore {
    pub score: i64,
    pub total: i64,
}

/// A completed, scored instance of a learner taking one test.
/// Append-only once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestAttempt {
    pub id: String,
    pub test_id: String,
    pub track: ExamTrack,
    pub test_name: String,
    pub score: i64,
    pub total_marks: i64,
    pub percentage: f64,
    pub timestamp: DateTime<Utc>,
    /// Time the learner spent on the test.
    pub duration_secs: i64,
    pub section_scores: BTreeMap<String, SectionScore>,
}

impl TestAttempt {
    /// Key used by the in-flight submission guard.
    pub fn fingerprint(&self) -> String {
        format!("{}:{}", self.track, self.test_id)
    }

    /// Checks the payload before it is stored anywhere.
    pub fn validation_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.id.trim().is_empty() {
            errors.push("attempt id must not be empty".to_string());
        }
        if self.test_id.trim().is_empty() {
            errors.push("test id must not be empty".to_string());
        }
        if self.score < 0 || self.total_marks < 0 {
            errors.push("scores must not be negative".to_string());
        }
        if self.score > self.total_marks {
            errors.push("score exceeds total marks".to_string());
        }
        if !self.percentage.is_finite() || !(0.0..=100.0).contains(&self.percentage) {
            errors.push("percentage must be between 0 and 100".to_string());
        }
        errors
    }
}

/// An attempt held locally because the remote store could not be reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAttempt {
    pub attempt: TestAttempt,
    pub answers: Vec<UserAnswer>,
    pub user_id: String,
    pub enqueued_at: DateTime<Utc>,
}

/// Where a history entry stands relative to the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryStatus {
    /// Confirmed by the backend.
    Synced,
    /// Visible but unconfirmed; waiting in the pending queue.
    Pending,
    /// Stored on this device only.
    Local,
}

impl HistoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryStatus::Synced => "synced",
            HistoryStatus::Pending => "pending",
            HistoryStatus::Local => "local",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "synced" => HistoryStatus::Synced,
            "pending" => HistoryStatus::Pending,
            _ => HistoryStatus::Local,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(flatten)]
    pub attempt: TestAttempt,
    pub status: HistoryStatus,
}

/// Represents a row of the remote 'attempts' table.
/// `(user_id, attempt_id)` is the natural key the backend enforces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub user_id: String,
    pub attempt_id: String,
    pub test_id: String,
    pub track: ExamTrack,
    pub test_name: String,
    pub score: i64,
    pub total_marks: i64,
    pub percentage: f64,
    pub completed_at: DateTime<Utc>,
    pub duration_secs: i64,
    pub section_scores: BTreeMap<String, SectionScore>,
    #[serde(default)]
    pub answers: Vec<UserAnswer>,
}

impl AttemptRecord {
    pub fn new(user_id: &str, attempt: &TestAttempt, answers: &[UserAnswer]) -> Self {
        Self {
            user_id: user_id.to_string(),
            attempt_id: attempt.id.clone(),
            test_id: attempt.test_id.clone(),
            track: attempt.track,
            test_name: attempt.test_name.clone(),
            score: attempt.score,
            total_marks: attempt.total_marks,
            percentage: attempt.percentage,
            completed_at: attempt.timestamp,
            duration_secs: attempt.duration_secs,
            section_scores: attempt.section_scores.clone(),
            answers: answers.to_vec(),
        }
    }
}

impl From<AttemptRecord> for TestAttempt {
    fn from(record: AttemptRecord) -> Self {
        Self {
            id: record.attempt_id,
            test_id: record.test_id,
            track: record.track,
            test_name: record.test_name,
            score: record.score,
            total_marks: record.total_marks,
            percentage: record.percentage,
            timestamp: record.completed_at,
            duration_secs: record.duration_secs,
            section_scores: record.section_scores,
        }
    }
}
