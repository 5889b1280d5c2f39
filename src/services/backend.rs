// src/services/backend.rs

//! Remote CRUD for tests, attempts and auth against the hosted backend.
//!
//! `Backend` is the seam: `RestBackend` talks to the hosted service over
//! HTTPS, tests plug in an in-process implementation. `BackendFacade`
//! wraps either one and gates privileged calls on the network monitor.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::json;
use url::Url;

use crate::{
    models::{
        attempt::{AttemptRecord, TestAttempt},
        test::TestDefinition,
        user::{AuthSession, AuthUser},
    },
    services::network::NetworkMonitor,
};

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    #[error("backend is not configured")]
    NotConfigured,

    #[error("record already exists")]
    Duplicate,

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("record not found")]
    NotFound,

    #[error("backend rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("malformed backend response: {0}")]
    Decode(String),
}

impl BackendError {
    /// Connectivity failures are recoverable by queueing and retrying later.
    pub fn is_connectivity(&self) -> bool {
        match self {
            BackendError::Unreachable(_) => true,
            BackendError::Rejected { status, .. } => matches!(status, 502..=504),
            _ => false,
        }
    }
}

/// Capabilities required from the hosted backend.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Cheap request proving the backend answers at all.
    async fn ping(&self) -> Result<(), BackendError>;

    async fn sign_up(&self, email: &str, password: &str) -> Result<AuthSession, BackendError>;
    async fn sign_in(&self, email: &str, password: &str) -> Result<AuthSession, BackendError>;
    /// Exchanges a refresh token for a new session.
    async fn refresh_session(&self, refresh_token: &str) -> Result<AuthSession, BackendError>;
    async fn sign_out(&self, access_token: &str) -> Result<(), BackendError>;
    async fn current_user(&self, access_token: &str) -> Result<AuthUser, BackendError>;

    /// Ordered by creation time, newest first.
    async fn list_tests(&self, live_only: bool) -> Result<Vec<TestDefinition>, BackendError>;
    async fn get_test(&self, id: &str) -> Result<TestDefinition, BackendError>;
    async fn create_test(&self, test: &TestDefinition) -> Result<(), BackendError>;
    async fn update_test(&self, test: &TestDefinition) -> Result<(), BackendError>;
    async fn delete_test(&self, id: &str) -> Result<(), BackendError>;
    async fn set_test_live(&self, id: &str, is_live: bool) -> Result<(), BackendError>;

    /// Returns `BackendError::Duplicate` when the natural key already exists.
    async fn insert_attempt(
        &self,
        access_token: &str,
        record: &AttemptRecord,
    ) -> Result<(), BackendError>;

    /// Ordered by completion time, newest first.
    async fn list_attempts(
        &self,
        access_token: &str,
        user_id: &str,
    ) -> Result<Vec<TestAttempt>, BackendError>;
}

/// Response shape of the hosted auth endpoints.
#[derive(Debug, Deserialize)]
struct AuthResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    user: Option<AuthUser>,
}

impl AuthResponse {
    fn into_session(self) -> Result<AuthSession, BackendError> {
        let user = self
            .user
            .ok_or_else(|| BackendError::Decode("auth response without user".to_string()))?;
        let access_token = self.access_token.ok_or_else(|| {
            BackendError::Unauthorized("Check your email to confirm the account.".to_string())
        })?;
        Ok(AuthSession {
            access_token,
            refresh_token: self.refresh_token,
            expires_at: self
                .expires_in
                .map(|secs| Utc::now() + ChronoDuration::seconds(secs)),
            user,
        })
    }
}

/// Client for a PostgREST/GoTrue style hosted backend.
#[derive(Clone)]
pub struct RestBackend {
    client: Client,
    base_url: Option<Url>,
    anon_key: String,
    service_key: Option<String>,
}

impl RestBackend {
    pub fn new(
        base_url: Option<&Url>,
        anon_key: String,
        service_key: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| BackendError::Unreachable(e.to_string()))?;

        let base_url = base_url.cloned();
        match &base_url {
            Some(url) => tracing::info!("Backend configured at {}", url),
            None => tracing::warn!("BACKEND_URL not set, running in local-only mode"),
        }

        Ok(Self {
            client,
            base_url,
            anon_key,
            service_key,
        })
    }

    /// Endpoint under the base URL. Query values are form-encoded, so ids
    /// cannot add filters of their own.
    fn endpoint(&self, path: &str, query: &[(&str, &str)]) -> Result<Url, BackendError> {
        let mut url = self.base_url.clone().ok_or(BackendError::NotConfigured)?;
        let full_path = format!("{}{}", url.path().trim_end_matches('/'), path);
        url.set_path(&full_path);
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    /// Request authorised with the anon key, or a user token when given.
    fn request(
        &self,
        method: reqwest::Method,
        url: Url,
        bearer: Option<&str>,
    ) -> Result<RequestBuilder, BackendError> {
        let token = bearer.unwrap_or(&self.anon_key);
        Ok(self
            .client
            .request(method, url)
            .header("apikey", &self.anon_key)
            .bearer_auth(token))
    }

    /// Admin writes use the service key when one is configured.
    fn admin_request(
        &self,
        method: reqwest::Method,
        url: Url,
    ) -> Result<RequestBuilder, BackendError> {
        let builder = self.request(method, url, self.service_key.as_deref())?;
        Ok(builder.header("Prefer", "return=minimal"))
    }

    async fn send(builder: RequestBuilder) -> Result<reqwest::Response, BackendError> {
        let response = builder.send().await.map_err(classify_transport)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, body))
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        builder: RequestBuilder,
    ) -> Result<T, BackendError> {
        let response = Self::send(builder).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))
    }
}

fn classify_transport(err: reqwest::Error) -> BackendError {
    if err.is_decode() {
        BackendError::Decode(err.to_string())
    } else {
        BackendError::Unreachable(err.to_string())
    }
}

fn classify_status(status: StatusCode, body: String) -> BackendError {
    // Postgres error code for unique violation is 23505
    if status == StatusCode::CONFLICT || body.contains("23505") {
        return BackendError::Duplicate;
    }
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BackendError::Unauthorized(
            extract_message(&body).unwrap_or_else(|| "Not authorized".to_string()),
        ),
        StatusCode::NOT_FOUND => BackendError::NotFound,
        _ => BackendError::Rejected {
            status: status.as_u16(),
            message: extract_message(&body).unwrap_or(body),
        },
    }
}

/// Pulls a human readable message out of the backend's error body.
fn extract_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    ["msg", "message", "error_description", "error"]
        .iter()
        .find_map(|key| value.get(*key).and_then(|v| v.as_str()))
        .map(str::to_string)
}

#[async_trait]
impl Backend for RestBackend {
    async fn ping(&self) -> Result<(), BackendError> {
        let url = self.endpoint("/auth/v1/health", &[])?;
        let response = self
            .request(reqwest::Method::GET, url, None)?
            .send()
            .await
            .map_err(classify_transport)?;
        if response.status().is_server_error() {
            return Err(classify_status(response.status(), String::new()));
        }
        Ok(())
    }

    async fn sign_up(&self, email: &str, password: &str) -> Result<AuthSession, BackendError> {
        let url = self.endpoint("/auth/v1/signup", &[])?;
        let builder = self
            .request(reqwest::Method::POST, url, None)?
            .json(&json!({ "email": email, "password": password }));
        Self::send_json::<AuthResponse>(builder)
            .await?
            .into_session()
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<AuthSession, BackendError> {
        let url = self.endpoint("/auth/v1/token", &[("grant_type", "password")])?;
        let builder = self
            .request(reqwest::Method::POST, url, None)?
            .json(&json!({ "email": email, "password": password }));
        Self::send_json::<AuthResponse>(builder)
            .await
            .map_err(|e| match e {
                // The auth service answers bad credentials with 400
                BackendError::Rejected { status: 400, .. } => {
                    BackendError::Unauthorized("Invalid email or password".to_string())
                }
                other => other,
            })?
            .into_session()
    }

    async fn refresh_session(&self, refresh_token: &str) -> Result<AuthSession, BackendError> {
        let url = self.endpoint("/auth/v1/token", &[("grant_type", "refresh_token")])?;
        let builder = self
            .request(reqwest::Method::POST, url, None)?
            .json(&json!({ "refresh_token": refresh_token }));
        Self::send_json::<AuthResponse>(builder)
            .await
            .map_err(|e| match e {
                // Revoked or already used refresh tokens come back as 400
                BackendError::Rejected { status: 400, .. } => {
                    BackendError::Unauthorized("Your session has ended. Sign in again.".to_string())
                }
                other => other,
            })?
            .into_session()
    }

    async fn sign_out(&self, access_token: &str) -> Result<(), BackendError> {
        let url = self.endpoint("/auth/v1/logout", &[])?;
        let builder = self.request(reqwest::Method::POST, url, Some(access_token))?;
        Self::send(builder).await.map(|_| ())
    }

    async fn current_user(&self, access_token: &str) -> Result<AuthUser, BackendError> {
        let url = self.endpoint("/auth/v1/user", &[])?;
        let builder = self.request(reqwest::Method::GET, url, Some(access_token))?;
        Self::send_json(builder).await
    }

    async fn list_tests(&self, live_only: bool) -> Result<Vec<TestDefinition>, BackendError> {
        let mut query = vec![("select", "*"), ("order", "created_at.desc")];
        if live_only {
            query.push(("is_live", "eq.true"));
        }
        let url = self.endpoint("/rest/v1/tests", &query)?;
        let builder = self.request(reqwest::Method::GET, url, None)?;
        Self::send_json(builder).await
    }

    async fn get_test(&self, id: &str) -> Result<TestDefinition, BackendError> {
        let filter = format!("eq.{}", id);
        let url = self.endpoint("/rest/v1/tests", &[("select", "*"), ("id", filter.as_str())])?;
        let builder = self.request(reqwest::Method::GET, url, None)?;
        let rows: Vec<TestDefinition> = Self::send_json(builder).await?;
        rows.into_iter().next().ok_or(BackendError::NotFound)
    }

    async fn create_test(&self, test: &TestDefinition) -> Result<(), BackendError> {
        let url = self.endpoint("/rest/v1/tests", &[])?;
        let builder = self.admin_request(reqwest::Method::POST, url)?.json(test);
        Self::send(builder).await.map(|_| ())
    }

    async fn update_test(&self, test: &TestDefinition) -> Result<(), BackendError> {
        let filter = format!("eq.{}", test.id);
        let url = self.endpoint("/rest/v1/tests", &[("id", filter.as_str())])?;
        let builder = self.admin_request(reqwest::Method::PATCH, url)?.json(test);
        Self::send(builder).await.map(|_| ())
    }

    async fn delete_test(&self, id: &str) -> Result<(), BackendError> {
        let filter = format!("eq.{}", id);
        let url = self.endpoint("/rest/v1/tests", &[("id", filter.as_str())])?;
        let builder = self.admin_request(reqwest::Method::DELETE, url)?;
        Self::send(builder).await.map(|_| ())
    }

    async fn set_test_live(&self, id: &str, is_live: bool) -> Result<(), BackendError> {
        let filter = format!("eq.{}", id);
        let url = self.endpoint("/rest/v1/tests", &[("id", filter.as_str())])?;
        let builder = self
            .admin_request(reqwest::Method::PATCH, url)?
            .json(&json!({ "is_live": is_live }));
        Self::send(builder).await.map(|_| ())
    }

    async fn insert_attempt(
        &self,
        access_token: &str,
        record: &AttemptRecord,
    ) -> Result<(), BackendError> {
        let url = self.endpoint("/rest/v1/attempts", &[])?;
        let builder = self
            .request(reqwest::Method::POST, url, Some(access_token))?
            .header("Prefer", "return=minimal")
            .json(record);
        Self::send(builder).await.map(|_| ())
    }

    async fn list_attempts(
        &self,
        access_token: &str,
        user_id: &str,
    ) -> Result<Vec<TestAttempt>, BackendError> {
        let filter = format!("eq.{}", user_id);
        let url = self.endpoint(
            "/rest/v1/attempts",
            &[
                ("select", "*"),
                ("user_id", filter.as_str()),
                ("order", "completed_at.desc"),
            ],
        )?;
        let builder = self.request(reqwest::Method::GET, url, Some(access_token))?;
        let rows: Vec<AttemptRecord> = Self::send_json(builder).await?;
        Ok(rows.into_iter().map(TestAttempt::from).collect())
    }
}

/// The backend as seen by the rest of the service.
///
/// Read paths go straight through. Privileged writes (admin content,
/// attempt submission) first run a bounded reachability probe and fail
/// fast with `BackendError::Unreachable` when it does not answer.
#[derive(Clone)]
pub struct BackendFacade {
    backend: Arc<dyn Backend>,
    network: NetworkMonitor,
    probe_timeout: Duration,
}

impl BackendFacade {
    pub fn new(backend: Arc<dyn Backend>, network: NetworkMonitor, probe_timeout: Duration) -> Self {
        Self {
            backend,
            network,
            probe_timeout,
        }
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.network
    }

    /// Probes the backend; used before privileged actions.
    pub async fn is_reachable(&self) -> bool {
        self.network.check_reachable(self.probe_timeout).await
    }

    async fn require_reachable(&self) -> Result<(), BackendError> {
        if self.is_reachable().await {
            Ok(())
        } else {
            Err(BackendError::Unreachable(
                "reachability probe failed".to_string(),
            ))
        }
    }

    fn require_online(&self) -> Result<(), BackendError> {
        if self.network.is_online() {
            Ok(())
        } else {
            Err(BackendError::Unreachable("device is offline".to_string()))
        }
    }

    pub async fn sign_up(&self, email: &str, password: &str) -> Result<AuthSession, BackendError> {
        self.require_online()?;
        self.backend.sign_up(email, password).await
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<AuthSession, BackendError> {
        self.require_online()?;
        self.backend.sign_in(email, password).await
    }

    pub async fn refresh_session(&self, refresh_token: &str) -> Result<AuthSession, BackendError> {
        self.require_online()?;
        self.backend.refresh_session(refresh_token).await
    }

    pub async fn sign_out(&self, access_token: &str) -> Result<(), BackendError> {
        self.require_online()?;
        self.backend.sign_out(access_token).await
    }

    pub async fn current_user(&self, access_token: &str) -> Result<AuthUser, BackendError> {
        self.require_online()?;
        self.backend.current_user(access_token).await
    }

    pub async fn list_tests(&self, live_only: bool) -> Result<Vec<TestDefinition>, BackendError> {
        self.require_online()?;
        self.backend.list_tests(live_only).await
    }

    pub async fn get_test(&self, id: &str) -> Result<TestDefinition, BackendError> {
        self.require_online()?;
        self.backend.get_test(id).await
    }

    pub async fn create_test(&self, test: &TestDefinition) -> Result<(), BackendError> {
        self.require_reachable().await?;
        self.backend.create_test(test).await
    }

    pub async fn update_test(&self, test: &TestDefinition) -> Result<(), BackendError> {
        self.require_reachable().await?;
        self.backend.update_test(test).await
    }

    pub async fn delete_test(&self, id: &str) -> Result<(), BackendError> {
        self.require_reachable().await?;
        self.backend.delete_test(id).await
    }

    pub async fn set_test_live(&self, id: &str, is_live: bool) -> Result<(), BackendError> {
        self.require_reachable().await?;
        self.backend.set_test_live(id, is_live).await
    }

    /// Callers probe reachability themselves to decide between the
    /// remote path and the pending queue.
    pub async fn insert_attempt(
        &self,
        access_token: &str,
        record: &AttemptRecord,
    ) -> Result<(), BackendError> {
        self.backend.insert_attempt(access_token, record).await
    }

    pub async fn list_attempts(
        &self,
        access_token: &str,
        user_id: &str,
    ) -> Result<Vec<TestAttempt>, BackendError> {
        self.require_online()?;
        self.backend.list_attempts(access_token, user_id).await
    }
}
