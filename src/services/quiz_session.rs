// src/services/quiz_session.rs

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::{
    error::AppError,
    models::{
        attempt::{SectionScore, TestAttempt, UserAnswer},
        question::QuestionView,
        test::TestDefinition,
    },
};

/// Score breakdown of the answers given so far.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreSummary {
    pub score: i64,
    pub total_marks: i64,
    pub percentage: f64,
    pub correct: usize,
    pub wrong: usize,
    pub unanswered: usize,
    pub section_scores: BTreeMap<String, SectionScore>,
}

/// Rounded to two decimals; zero when nothing could be scored.
pub fn percentage(score: i64, total: i64) -> f64 {
    if total <= 0 {
        return 0.0;
    }
    ((score as f64 / total as f64) * 10_000.0).round() / 100.0
}

/// One learner taking one test.
///
/// The session owns a clone of the definition, so admin edits made while
/// the learner is answering do not affect scoring. The attempt id is fixed
/// at start, so finishing the same session twice yields the same attempt.
#[derive(Debug, Clone)]
pub struct QuizSession {
    attempt_id: String,
    test: TestDefinition,
    answers: HashMap<String, UserAnswer>,
    cursor: usize,
    started_at: DateTime<Utc>,
}

impl QuizSession {
    pub fn start(test: TestDefinition, now: DateTime<Utc>) -> Result<Self, AppError> {
        if !test.is_live {
            return Err(AppError::NotFound(format!(
                "Test '{}' is not available",
                test.id
            )));
        }
        if test.question_count() == 0 {
            return Err(AppError::BadRequest(format!(
                "Test '{}' has no questions",
                test.id
            )));
        }
        tracing::info!(test_id = %test.id, "Quiz session started");
        Ok(Self {
            attempt_id: uuid::Uuid::new_v4().to_string(),
            test,
            answers: HashMap::new(),
            cursor: 0,
            started_at: now,
        })
    }

    pub fn attempt_id(&self) -> &str {
        &self.attempt_id
    }

    pub fn test(&self) -> &TestDefinition {
        &self.test
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn answers(&self) -> impl Iterator<Item = &UserAnswer> {
        self.answers.values()
    }

    /// Records the learner's choice; a later choice for the same
    /// question replaces the earlier one.
    pub fn select_answer(
        &mut self,
        question_id: &str,
        selected: &str,
    ) -> Result<&UserAnswer, AppError> {
        let question = self
            .test
            .find_question(question_id)
            .ok_or_else(|| AppError::NotFound(format!("Question '{}' not found", question_id)))?;

        let value = question.resolve_option(selected).ok_or_else(|| {
            AppError::BadRequest(format!(
                "'{}' is not an option of question '{}'",
                selected, question_id
            ))
        })?;

        let is_correct = value == question.correct_answer;
        let answer = UserAnswer {
            question_id: question.id.clone(),
            selected_option: value.to_string(),
            is_correct,
            marks_awarded: if is_correct { question.marks } else { 0 },
        };

        self.answers.insert(question.id.clone(), answer);
        self.answers
            .get(question_id)
            .ok_or_else(|| AppError::InternalServerError("answer vanished".to_string()))
    }

    pub fn clear_answer(&mut self, question_id: &str) -> bool {
        self.answers.remove(question_id).is_some()
    }

    pub fn next(&mut self) -> usize {
        if self.cursor + 1 < self.test.question_count() {
            self.cursor += 1;
        }
        self.cursor
    }

    pub fn previous(&mut self) -> usize {
        self.cursor = self.cursor.saturating_sub(1);
        self.cursor
    }

    pub fn go_to(&mut self, index: usize) -> Result<usize, AppError> {
        if index >= self.test.question_count() {
            return Err(AppError::BadRequest(format!(
                "Question index {} is out of range",
                index
            )));
        }
        self.cursor = index;
        Ok(self.cursor)
    }

    pub fn question_at(&self, index: usize) -> Option<QuestionView> {
        let (section, question) = self.test.questions().nth(index)?;
        Some(QuestionView {
            index,
            section: section.name.clone(),
            id: question.id.clone(),
            prompt: question.prompt.clone(),
            prompt_hi: question.prompt_hi.clone(),
            options: question.options.clone(),
            options_hi: question.options_hi.clone(),
            marks: question.marks,
            selected_option: self
                .answers
                .get(&question.id)
                .map(|a| a.selected_option.clone()),
        })
    }

    pub fn current_question(&self) -> Option<QuestionView> {
        self.question_at(self.cursor)
    }

    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        let deadline = self.started_at + Duration::minutes(self.test.duration_minutes);
        (deadline - now).max(Duration::zero())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.remaining(now).is_zero()
    }

    pub fn summary(&self) -> ScoreSummary {
        let mut summary = ScoreSummary {
            score: 0,
            total_marks: 0,
            percentage: 0.0,
            correct: 0,
            wrong: 0,
            unanswered: 0,
            section_scores: BTreeMap::new(),
        };

        for (section, question) in self.test.questions() {
            let entry = summary
                .section_scores
                .entry(section.name.clone())
                .or_default();
            entry.total += question.marks;
            summary.total_marks += question.marks;

            match self.answers.get(&question.id) {
                Some(answer) if answer.is_correct => {
                    summary.correct += 1;
                    summary.score += answer.marks_awarded;
                    entry.score += answer.marks_awarded;
                }
                Some(_) => summary.wrong += 1,
                None => summary.unanswered += 1,
            }
        }

        summary.percentage = percentage(summary.score, summary.total_marks);
        summary
    }

    /// Scores the session into an attempt plus the answers given.
    pub fn finish(&self, now: DateTime<Utc>) -> (TestAttempt, Vec<UserAnswer>) {
        let summary = self.summary();
        let duration_secs = (now - self.started_at)
            .num_seconds()
            .clamp(0, self.test.duration_minutes * 60);

        let attempt = TestAttempt {
            id: self.attempt_id.clone(),
            test_id: self.test.id.clone(),
            track: self.test.track,
            test_name: self.test.name.clone(),
            score: summary.score,
            total_marks: summary.total_marks,
            percentage: summary.percentage,
            timestamp: now,
            duration_secs,
            section_scores: summary.section_scores,
        };

        // Answers in question order keep the stored record stable.
        let answers = self
            .test
            .questions()
            .filter_map(|(_, q)| self.answers.get(&q.id).cloned())
            .collect();

        (attempt, answers)
    }
}

/// Holds the one active quiz session of this service.
#[derive(Clone, Default)]
pub struct QuizSessionStore {
    inner: Arc<Mutex<Option<QuizSession>>>,
}

impl QuizSessionStore {
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, Option<QuizSession>> {
        self.inner.lock().await
    }

    /// Replaces any running session; answers start empty.
    pub async fn start(&self, session: QuizSession) {
        *self.inner.lock().await = Some(session);
    }

    pub async fn reset(&self) {
        *self.inner.lock().await = None;
    }
}
