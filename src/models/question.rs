// src/models/question.rs

use serde::{Deserialize, Serialize};
use validator::Validate;

/// A single multiple-choice question inside a section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Question {
    /// Unique within the owning test.
    #[validate(length(min = 1, max = 64))]
    pub id: String,

    /// The English prompt.
    #[validate(length(min = 1, max = 4000))]
    pub prompt: String,

    /// The Hindi prompt, when translated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_hi: Option<String>,

    /// Option strings in display order (e.g., ["Delhi", "Mumbai"]).
    #[validate(custom(function = validate_options))]
    pub options: Vec<String>,

    /// Hindi options, parallel to `options`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options_hi: Option<Vec<String>>,

    /// The correct option value, one of `options`.
    #[validate(length(min = 1, max = 500))]
    pub correct_answer: String,

    #[validate(range(min = 1, max = 100))]
    pub marks: i64,
}

impl Question {
    /// Resolves a selected option to its English value.
    ///
    /// The learner may pick either the English or the Hindi rendering; both
    /// map to the same `options` entry by position.
    pub fn resolve_option(&self, selected: &str) -> Option<&str> {
        if let Some(opt) = self.options.iter().find(|o| o.as_str() == selected) {
            return Some(opt.as_str());
        }
        let hi = self.options_hi.as_ref()?;
        let idx = hi.iter().position(|o| o.as_str() == selected)?;
        self.options.get(idx).map(String::as_str)
    }

    /// Structural invariants beyond field validation.
    pub fn invariant_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if let Some(hi) = &self.options_hi {
            if hi.len() != self.options.len() {
                errors.push(format!(
                    "question '{}': options_hi has {} entries, options has {}",
                    self.id,
                    hi.len(),
                    self.options.len()
                ));
            }
        }
        if !self.options.contains(&self.correct_answer) {
            errors.push(format!(
                "question '{}': correct_answer is not one of the options",
                self.id
            ));
        }
        errors
    }
}

/// DTO for sending a question to the client (excludes the correct answer).
#[derive(Debug, Clone, Serialize)]
pub struct QuestionView {
    pub index: usize,
    pub section: String,
    pub id: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_hi: Option<String>,
    pub options: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options_hi: Option<Vec<String>>,
    pub marks: i64,
    pub selected_option: Option<String>,
}

fn validate_options(options: &[String]) -> Result<(), validator::ValidationError> {
    if options.len() < 2 {
        return Err(validator::ValidationError::new("at_least_two_options"));
    }
    for opt in options {
        if opt.is_empty() || opt.len() > 500 {
            return Err(validator::ValidationError::new("option_length"));
        }
    }
    Ok(())
}
