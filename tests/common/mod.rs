// tests/common/mod.rs

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Query, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use mock_test::{
    config::Config,
    models::attempt::AttemptRecord,
    routes,
    services::backend::{Backend, RestBackend},
    state::AppState,
    utils::hash::hash_password,
};
use serde_json::{Value, json};
use sqlx::sqlite::SqlitePoolOptions;
use url::Url;

pub const ADMIN_USERNAME: &str = "root";
pub const ADMIN_PASSWORD: &str = "admin-pass";
pub const WRONG_PASSWORD: &str = "wrong-password";

/// Stand-in for the hosted backend, speaking the same REST dialect.
/// `set_down(true)` makes every endpoint answer 503.
#[derive(Default)]
pub struct FakeBackend {
    down: AtomicBool,
    short_sessions: AtomicBool,
    refresh_grants: AtomicUsize,
    tests: Mutex<Vec<Value>>,
    attempts: Mutex<Vec<AttemptRecord>>,
}

impl FakeBackend {
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Sessions issued while set expire immediately.
    pub fn set_short_sessions(&self, short: bool) {
        self.short_sessions.store(short, Ordering::SeqCst);
    }

    pub fn refresh_grants(&self) -> usize {
        self.refresh_grants.load(Ordering::SeqCst)
    }

    pub fn seed_test(&self, test: Value) {
        self.tests.lock().unwrap().insert(0, test);
    }

    pub fn attempt_ids(&self) -> Vec<String> {
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.attempt_id.clone())
            .collect()
    }
}

fn eq_filter<'a>(params: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.strip_prefix("eq."))
}

fn user_id_from(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer token-"))
        .map(str::to_string)
}

async fn outage(State(fake): State<Arc<FakeBackend>>, req: Request, next: Next) -> Response {
    if fake.down.load(Ordering::SeqCst) {
        return (StatusCode::SERVICE_UNAVAILABLE, "maintenance").into_response();
    }
    next.run(req).await
}

async fn health() -> StatusCode {
    StatusCode::OK
}

fn session_body(fake: &FakeBackend, id: &str) -> Response {
    let expires_in = if fake.short_sessions.load(Ordering::SeqCst) {
        0
    } else {
        3600
    };
    Json(json!({
        "access_token": format!("token-{}", id),
        "refresh_token": format!("refresh-{}", id),
        "expires_in": expires_in,
        "user": { "id": id, "email": format!("{}@example.com", id) },
    }))
    .into_response()
}

async fn issue_session(State(fake): State<Arc<FakeBackend>>, Json(body): Json<Value>) -> Response {
    if body["password"] == WRONG_PASSWORD {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error_description": "Invalid login credentials" })),
        )
            .into_response();
    }
    let email = body["email"].as_str().unwrap_or_default();
    let id = email.split('@').next().unwrap_or_default();
    session_body(&fake, id)
}

async fn token(
    State(fake): State<Arc<FakeBackend>>,
    Query(params): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> Response {
    if params.get("grant_type").map(String::as_str) != Some("refresh_token") {
        return issue_session(State(fake), Json(body)).await;
    }
    fake.refresh_grants.fetch_add(1, Ordering::SeqCst);
    match body["refresh_token"]
        .as_str()
        .and_then(|t| t.strip_prefix("refresh-"))
    {
        Some(id) => session_body(&fake, id),
        None => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error_description": "Invalid Refresh Token" })),
        )
            .into_response(),
    }
}

async fn logout() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn current_user(headers: HeaderMap) -> Response {
    match user_id_from(&headers) {
        Some(id) => Json(json!({ "id": id, "email": format!("{}@example.com", id) })).into_response(),
        None => (StatusCode::UNAUTHORIZED, Json(json!({ "msg": "invalid JWT" }))).into_response(),
    }
}

async fn list_tests(
    State(fake): State<Arc<FakeBackend>>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Vec<Value>> {
    let id = eq_filter(&params, "id");
    let live_only = eq_filter(&params, "is_live") == Some("true");
    let tests = fake.tests.lock().unwrap();
    Json(
        tests
            .iter()
            .filter(|t| id.is_none_or(|id| t["id"] == id))
            .filter(|t| !live_only || t["is_live"] == true)
            .cloned()
            .collect(),
    )
}

async fn create_test(State(fake): State<Arc<FakeBackend>>, Json(test): Json<Value>) -> Response {
    let mut tests = fake.tests.lock().unwrap();
    if tests.iter().any(|t| t["id"] == test["id"]) {
        return (
            StatusCode::CONFLICT,
            Json(json!({ "code": "23505", "message": "duplicate key value" })),
        )
            .into_response();
    }
    tests.insert(0, test);
    StatusCode::CREATED.into_response()
}

async fn patch_test(
    State(fake): State<Arc<FakeBackend>>,
    Query(params): Query<HashMap<String, String>>,
    Json(patch): Json<Value>,
) -> StatusCode {
    let id = eq_filter(&params, "id").unwrap_or_default();
    let mut tests = fake.tests.lock().unwrap();
    if let Some(test) = tests.iter_mut().find(|t| t["id"] == id) {
        if let (Some(target), Some(fields)) = (test.as_object_mut(), patch.as_object()) {
            for (key, value) in fields {
                target.insert(key.clone(), value.clone());
            }
        }
    }
    StatusCode::NO_CONTENT
}

async fn delete_test(
    State(fake): State<Arc<FakeBackend>>,
    Query(params): Query<HashMap<String, String>>,
) -> StatusCode {
    let id = eq_filter(&params, "id").unwrap_or_default();
    fake.tests.lock().unwrap().retain(|t| t["id"] != id);
    StatusCode::NO_CONTENT
}

async fn insert_attempt(
    State(fake): State<Arc<FakeBackend>>,
    Json(record): Json<AttemptRecord>,
) -> Response {
    let mut attempts = fake.attempts.lock().unwrap();
    if attempts
        .iter()
        .any(|r| r.user_id == record.user_id && r.attempt_id == record.attempt_id)
    {
        return (
            StatusCode::CONFLICT,
            Json(json!({ "code": "23505", "message": "duplicate key value" })),
        )
            .into_response();
    }
    attempts.push(record);
    StatusCode::CREATED.into_response()
}

async fn list_attempts(
    State(fake): State<Arc<FakeBackend>>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Vec<AttemptRecord>> {
    let user_id = eq_filter(&params, "user_id").unwrap_or_default();
    let mut rows: Vec<AttemptRecord> = fake
        .attempts
        .lock()
        .unwrap()
        .iter()
        .filter(|r| r.user_id == user_id)
        .cloned()
        .collect();
    rows.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
    Json(rows)
}

async fn spawn_fake_backend(fake: Arc<FakeBackend>) -> String {
    let app = Router::new()
        .route("/auth/v1/health", get(health))
        .route("/auth/v1/signup", post(issue_session))
        .route("/auth/v1/token", post(token))
        .route("/auth/v1/logout", post(logout))
        .route("/auth/v1/user", get(current_user))
        .route(
            "/rest/v1/tests",
            get(list_tests)
                .post(create_test)
                .patch(patch_test)
                .delete(delete_test),
        )
        .route("/rest/v1/attempts", get(list_attempts).post(insert_attempt))
        .layer(middleware::from_fn_with_state(fake.clone(), outage))
        .with_state(fake);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind random port");
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("http://127.0.0.1:{}", port)
}

/// Two questions worth 2 marks each. Correct answers are "Delhi" and "Ganga".
pub fn sample_test(id: &str) -> Value {
    json!({
        "id": id,
        "track": "ssc",
        "name": format!("SSC Mock {}", id),
        "name_hi": "एसएससी मॉक",
        "total_marks": 4,
        "duration_minutes": 30,
        "is_live": true,
        "sections": [{
            "name": "General Awareness",
            "questions": [
                {
                    "id": "q1",
                    "prompt": "Capital of India?",
                    "options": ["Delhi", "Mumbai"],
                    "options_hi": ["दिल्ली", "मुंबई"],
                    "correct_answer": "Delhi",
                    "marks": 2
                },
                {
                    "id": "q2",
                    "prompt": "Longest river of India?",
                    "options": ["Yamuna", "Ganga"],
                    "correct_answer": "Ganga",
                    "marks": 2
                }
            ]
        }]
    })
}

pub struct TestApp {
    pub address: String,
    pub backend: Arc<FakeBackend>,
    pub client: reqwest::Client,
}

impl TestApp {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.address, path)
    }

    pub async fn sign_in(&self, email: &str) -> reqwest::Response {
        self.client
            .post(self.url("/api/auth/sign-in"))
            .json(&json!({ "email": email, "password": "learner-pass" }))
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn start_quiz(&self, test_id: &str) -> reqwest::Response {
        self.client
            .post(self.url("/api/quiz/start"))
            .json(&json!({ "test_id": test_id }))
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn answer(&self, question_id: &str, option: &str) -> reqwest::Response {
        self.client
            .put(self.url("/api/quiz/answers"))
            .json(&json!({ "question_id": question_id, "option": option }))
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn submit(&self) -> reqwest::Response {
        self.client
            .post(self.url("/api/quiz/submit"))
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn pending(&self) -> Value {
        self.client
            .get(self.url("/api/attempts/pending"))
            .send()
            .await
            .expect("Failed to execute request")
            .json()
            .await
            .unwrap()
    }

    pub async fn admin_token(&self) -> String {
        let body: Value = self
            .client
            .post(self.url("/api/admin/login"))
            .json(&json!({ "username": ADMIN_USERNAME, "password": ADMIN_PASSWORD }))
            .send()
            .await
            .expect("Failed to execute request")
            .json()
            .await
            .unwrap();
        body["token"].as_str().unwrap().to_string()
    }
}

/// Spawns the app against a fresh fake backend and in-memory cache,
/// on a random port.
pub async fn spawn_app() -> TestApp {
    let fake = Arc::new(FakeBackend::default());
    let backend_url = spawn_fake_backend(fake.clone()).await;

    // 1. One connection keeps the in-memory database alive
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to open in-memory cache");

    // 2. Run migrations
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to migrate database");

    // 3. Create test configuration and state
    let config = Config {
        cache_database_url: "sqlite::memory:".to_string(),
        backend_url: Some(Url::parse(&backend_url).unwrap()),
        backend_anon_key: "anon".to_string(),
        backend_service_key: None,
        jwt_secret: "test_secret_for_integration_tests".to_string(),
        jwt_expiration: 600,
        admin_username: Some(ADMIN_USERNAME.to_string()),
        admin_password: None,
        admin_password_hash: Some(hash_password(ADMIN_PASSWORD).unwrap()),
        probe_timeout_ms: 1_000,
        duplicate_window_secs: 10,
        test_cache_ttl_secs: 3_600,
        bind_addr: "127.0.0.1:0".to_string(),
        static_dir: None,
        rust_log: "error".to_string(),
    };

    let remote: Arc<dyn Backend> = Arc::new(
        RestBackend::new(
            config.backend_url.as_ref(),
            config.backend_anon_key.clone(),
            None,
            Duration::from_secs(5),
        )
        .unwrap(),
    );

    let state = AppState::new(pool, config, remote);
    state.start().await;

    // 4. Create the router with the app state
    let app = routes::create_router(state);

    // 5. Bind to port 0 to get a random available port
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind random port");
    let port = listener.local_addr().unwrap().port();

    // 6. Spawn the server in the background
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestApp {
        address: format!("http://127.0.0.1:{}", port),
        backend: fake,
        client: reqwest::Client::new(),
    }
}
