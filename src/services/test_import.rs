// src/services/test_import.rs

//! Admin uploads arrive as JSON text and are parsed against a closed
//! schema. Nothing in the upload is ever executed.

use std::collections::HashSet;
use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use serde::Deserialize;
use validator::Validate;

use crate::{
    error::AppError,
    models::{
        question::Question,
        test::{ExamTrack, Section, TestDefinition},
    },
    utils::html::clean_html,
};

static ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$").expect("valid id pattern"));

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ImportedTest {
    id: Option<String>,
    track: ExamTrack,
    name: String,
    name_hi: Option<String>,
    total_marks: Option<i64>,
    scheduled_date: Option<NaiveDate>,
    duration_minutes: i64,
    #[serde(default)]
    is_live: bool,
    sections: Vec<ImportedSection>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ImportedSection {
    name: String,
    name_hi: Option<String>,
    questions: Vec<ImportedQuestion>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ImportedQuestion {
    id: String,
    prompt: String,
    prompt_hi: Option<String>,
    options: Vec<String>,
    options_hi: Option<Vec<String>>,
    correct_answer: String,
    marks: i64,
}

fn clean(text: String) -> String {
    clean_html(&text).trim().to_string()
}

fn clean_opt(text: Option<String>) -> Option<String> {
    text.map(clean).filter(|t| !t.is_empty())
}

impl From<ImportedQuestion> for Question {
    fn from(q: ImportedQuestion) -> Self {
        Question {
            id: q.id.trim().to_string(),
            prompt: clean(q.prompt),
            prompt_hi: clean_opt(q.prompt_hi),
            options: q.options.into_iter().map(clean).collect(),
            options_hi: q
                .options_hi
                .map(|opts| opts.into_iter().map(clean).collect()),
            correct_answer: clean(q.correct_answer),
            marks: q.marks,
        }
    }
}

/// Parses an uploaded test definition.
///
/// Every problem found is reported in a single validation error so the
/// admin can fix the upload in one pass.
pub fn parse_test_definition(raw: &str) -> Result<TestDefinition, AppError> {
    let imported: ImportedTest = serde_json::from_str(raw)
        .map_err(|e| AppError::BadRequest(format!("Invalid test definition: {}", e)))?;

    let sections: Vec<Section> = imported
        .sections
        .into_iter()
        .map(|s| Section {
            name: clean(s.name),
            name_hi: clean_opt(s.name_hi),
            questions: s.questions.into_iter().map(Question::from).collect(),
        })
        .collect();

    let question_marks: i64 = sections
        .iter()
        .flat_map(|s| s.questions.iter())
        .map(|q| q.marks)
        .sum();

    let test = TestDefinition {
        id: imported
            .id
            .map(|id| id.trim().to_string())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        track: imported.track,
        name: clean(imported.name),
        name_hi: clean_opt(imported.name_hi),
        total_marks: imported.total_marks.unwrap_or(question_marks),
        scheduled_date: imported.scheduled_date,
        duration_minutes: imported.duration_minutes,
        is_live: imported.is_live,
        sections,
        created_at: None,
    };

    validate_definition(&test)?;
    Ok(test)
}

/// Structural checks shared by uploads and full replacements.
pub fn validate_definition(test: &TestDefinition) -> Result<(), AppError> {
    let mut problems = Vec::new();

    if let Err(errors) = test.validate() {
        problems.push(errors.to_string());
    }
    if !ID_PATTERN.is_match(&test.id) {
        problems.push(format!(
            "test id '{}' must be 1-64 letters, digits, '-' or '_'",
            test.id
        ));
    }

    let mut seen = HashSet::new();
    let mut question_marks = 0;
    for section in &test.sections {
        if section.questions.is_empty() {
            problems.push(format!("section '{}' has no questions", section.name));
        }
        for question in &section.questions {
            if !seen.insert(question.id.as_str()) {
                problems.push(format!("question id '{}' is used twice", question.id));
            }
            problems.extend(question.invariant_errors());
            question_marks += question.marks;
        }
    }
    if test.total_marks != question_marks {
        problems.push(format!(
            "total_marks is {} but questions add up to {}",
            test.total_marks, question_marks
        ));
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(AppError::BadRequest(problems.join("; ")))
    }
}
