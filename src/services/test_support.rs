// src/services/test_support.rs

//! Fixtures shared by the service unit tests.

#![allow(clippy::unwrap_used)]

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::models::{
    attempt::{AttemptRecord, TestAttempt},
    question::Question,
    test::{ExamTrack, Section, TestDefinition},
    user::{AuthSession, AuthUser},
};
use crate::services::backend::{Backend, BackendError};

pub async fn memory_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

/// One section with a single question worth `marks`; "Delhi" is correct.
pub fn sample_test(id: &str, marks: i64) -> TestDefinition {
    TestDefinition {
        id: id.to_string(),
        track: ExamTrack::Ssc,
        name: format!("Mock {}", id),
        name_hi: None,
        total_marks: marks,
        scheduled_date: None,
        duration_minutes: 30,
        is_live: true,
        sections: vec![Section {
            name: "General Awareness".to_string(),
            name_hi: None,
            questions: vec![Question {
                id: "q1".to_string(),
                prompt: "Capital of India?".to_string(),
                prompt_hi: None,
                options: vec!["Delhi".to_string(), "Mumbai".to_string()],
                options_hi: None,
                correct_answer: "Delhi".to_string(),
                marks,
            }],
        }],
        created_at: None,
    }
}

pub fn sample_attempt(id: &str, test_id: &str, at: DateTime<Utc>) -> TestAttempt {
    TestAttempt {
        id: id.to_string(),
        test_id: test_id.to_string(),
        track: ExamTrack::Ssc,
        test_name: format!("Mock {}", test_id),
        score: 2,
        total_marks: 2,
        percentage: 100.0,
        timestamp: at,
        duration_secs: 60,
        section_scores: BTreeMap::new(),
    }
}

pub fn session_for(user_id: &str) -> AuthSession {
    AuthSession {
        access_token: format!("token-{}", user_id),
        refresh_token: Some(format!("refresh-{}", user_id)),
        expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
        user: AuthUser {
            id: user_id.to_string(),
            email: format!("{}@example.com", user_id),
        },
    }
}

/// In-process backend whose reachability can be flipped by the test.
#[derive(Default)]
pub struct ScriptedBackend {
    pub unreachable: AtomicBool,
    pub insert_calls: AtomicUsize,
    pub refresh_calls: AtomicUsize,
    /// Inserts with these attempt ids are rejected with a 400.
    pub rejected_attempts: Mutex<Vec<String>>,
    pub attempts: Mutex<Vec<AttemptRecord>>,
    pub tests: Mutex<Vec<TestDefinition>>,
}

impl ScriptedBackend {
    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    pub fn stored_attempt_ids(&self) -> Vec<String> {
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.attempt_id.clone())
            .collect()
    }

    pub fn reject_attempt(&self, attempt_id: &str) {
        self.rejected_attempts
            .lock()
            .unwrap()
            .push(attempt_id.to_string());
    }

    pub fn accept_attempt(&self, attempt_id: &str) {
        self.rejected_attempts
            .lock()
            .unwrap()
            .retain(|id| id != attempt_id);
    }

    fn check(&self) -> Result<(), BackendError> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(BackendError::Unreachable("scripted outage".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn ping(&self) -> Result<(), BackendError> {
        self.check()
    }

    async fn sign_up(&self, email: &str, _password: &str) -> Result<AuthSession, BackendError> {
        self.check()?;
        Ok(session_for(email.split('@').next().unwrap_or(email)))
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<AuthSession, BackendError> {
        self.check()?;
        if password == "wrong-password" {
            return Err(BackendError::Unauthorized("Invalid email or password".to_string()));
        }
        Ok(session_for(email.split('@').next().unwrap_or(email)))
    }

    async fn refresh_session(&self, refresh_token: &str) -> Result<AuthSession, BackendError> {
        self.check()?;
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        match refresh_token.strip_prefix("refresh-") {
            Some(user_id) => Ok(session_for(user_id)),
            None => Err(BackendError::Unauthorized("Invalid refresh token".to_string())),
        }
    }

    async fn sign_out(&self, _access_token: &str) -> Result<(), BackendError> {
        self.check()
    }

    async fn current_user(&self, access_token: &str) -> Result<AuthUser, BackendError> {
        self.check()?;
        let id = access_token.trim_start_matches("token-");
        Ok(session_for(id).user)
    }

    async fn list_tests(&self, live_only: bool) -> Result<Vec<TestDefinition>, BackendError> {
        self.check()?;
        Ok(self
            .tests
            .lock()
            .unwrap()
            .iter()
            .filter(|t| !live_only || t.is_live)
            .cloned()
            .collect())
    }

    async fn get_test(&self, id: &str) -> Result<TestDefinition, BackendError> {
        self.check()?;
        self.tests
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or(BackendError::NotFound)
    }

    async fn create_test(&self, test: &TestDefinition) -> Result<(), BackendError> {
        self.check()?;
        let mut tests = self.tests.lock().unwrap();
        if tests.iter().any(|t| t.id == test.id) {
            return Err(BackendError::Duplicate);
        }
        tests.insert(0, test.clone());
        Ok(())
    }

    async fn update_test(&self, test: &TestDefinition) -> Result<(), BackendError> {
        self.check()?;
        let mut tests = self.tests.lock().unwrap();
        let slot = tests
            .iter_mut()
            .find(|t| t.id == test.id)
            .ok_or(BackendError::NotFound)?;
        *slot = test.clone();
        Ok(())
    }

    async fn delete_test(&self, id: &str) -> Result<(), BackendError> {
        self.check()?;
        let mut tests = self.tests.lock().unwrap();
        let before = tests.len();
        tests.retain(|t| t.id != id);
        if tests.len() == before {
            return Err(BackendError::NotFound);
        }
        Ok(())
    }

    async fn set_test_live(&self, id: &str, is_live: bool) -> Result<(), BackendError> {
        self.check()?;
        let mut tests = self.tests.lock().unwrap();
        let test = tests
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(BackendError::NotFound)?;
        test.is_live = is_live;
        Ok(())
    }

    async fn insert_attempt(
        &self,
        _access_token: &str,
        record: &AttemptRecord,
    ) -> Result<(), BackendError> {
        self.check()?;
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        if self
            .rejected_attempts
            .lock()
            .unwrap()
            .contains(&record.attempt_id)
        {
            return Err(BackendError::Rejected {
                status: 400,
                message: "invalid attempt".to_string(),
            });
        }
        let mut attempts = self.attempts.lock().unwrap();
        if attempts
            .iter()
            .any(|r| r.user_id == record.user_id && r.attempt_id == record.attempt_id)
        {
            return Err(BackendError::Duplicate);
        }
        attempts.push(record.clone());
        Ok(())
    }

    async fn list_attempts(
        &self,
        _access_token: &str,
        user_id: &str,
    ) -> Result<Vec<TestAttempt>, BackendError> {
        self.check()?;
        let mut rows: Vec<TestAttempt> = self
            .attempts
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .map(TestAttempt::from)
            .collect();
        rows.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(rows)
    }
}

pub fn test_config() -> crate::config::Config {
    crate::config::Config {
        cache_database_url: "sqlite::memory:".to_string(),
        backend_url: None,
        backend_anon_key: String::new(),
        backend_service_key: None,
        jwt_secret: "unit-test-secret".to_string(),
        jwt_expiration: 60,
        admin_username: None,
        admin_password: None,
        admin_password_hash: None,
        probe_timeout_ms: 200,
        duplicate_window_secs: 10,
        test_cache_ttl_secs: 3_600,
        bind_addr: "127.0.0.1:0".to_string(),
        static_dir: None,
        rust_log: "error".to_string(),
    }
}
