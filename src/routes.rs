// src/routes.rs

use axum::{
    Router,
    http::{HeaderValue, Method, header},
    middleware,
    routing::{delete, get, post, put},
};
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};

use crate::{
    handlers::{admin, attempts, auth, catalog, network, quiz},
    state::AppState,
    utils::jwt::admin_middleware,
};

/// Assembles the main application router.
///
/// * Merges all sub-routers (auth, tests, quiz, attempts, network, admin).
/// * Applies global middleware (Trace, CORS).
/// * Serves the UI bundle from `STATIC_DIR` when configured.
pub fn create_router(state: AppState) -> Router {
    let origins = [
        HeaderValue::from_static("http://localhost:3000"),
        HeaderValue::from_static("http://127.0.0.1:3000"),
    ];

    let cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    let auth_routes = Router::new()
        .route("/sign-up", post(auth::sign_up))
        .route("/sign-in", post(auth::sign_in))
        .route("/sign-out", post(auth::sign_out))
        .route("/me", get(auth::me));

    let test_routes = Router::new()
        .route("/", get(catalog::list_tests))
        .route("/{id}", get(catalog::get_test));

    let quiz_routes = Router::new()
        .route("/", get(quiz::get_quiz))
        .route("/start", post(quiz::start_quiz))
        .route("/answers", put(quiz::answer_question))
        .route("/answers/{question_id}", delete(quiz::clear_answer))
        .route("/navigate", post(quiz::navigate))
        .route("/submit", post(quiz::submit_quiz));

    let attempt_routes = Router::new()
        .route("/", get(attempts::list_attempts))
        .route("/pending", get(attempts::list_pending))
        .route("/resync", post(attempts::resync));

    let network_routes = Router::new()
        .route("/", get(network::get_status).put(network::report_status))
        .route("/probe", get(network::probe));

    let admin_routes = Router::new()
        .route("/logout", post(admin::logout))
        .route("/tests", post(admin::create_test))
        .route(
            "/tests/{id}",
            put(admin::update_test).delete(admin::delete_test),
        )
        .route("/tests/{id}/live", put(admin::set_live))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            admin_middleware,
        ))
        // Login stays outside the token check
        .route("/login", post(admin::login));

    let mut router = Router::new()
        .nest("/api/auth", auth_routes)
        .nest("/api/tests", test_routes)
        .nest("/api/quiz", quiz_routes)
        .nest("/api/attempts", attempt_routes)
        .nest("/api/network", network_routes)
        .nest("/api/admin", admin_routes);

    if let Some(dir) = &state.config.static_dir {
        router = router.fallback_service(ServeDir::new(dir));
    }

    router
        // Global Middleware (applied from outside in)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    use super::*;
    use crate::services::test_support::{ScriptedBackend, memory_pool, test_config};

    async fn router(backend: Arc<ScriptedBackend>) -> Router {
        let state = AppState::new(memory_pool().await, test_config(), backend);
        create_router(state)
    }

    #[tokio::test]
    async fn network_status_reports_online_without_pending() {
        let app = router(Arc::new(ScriptedBackend::default())).await;

        let response = app
            .oneshot(Request::get("/api/network").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["online"], true);
        assert_eq!(body["has_pending"], false);
    }

    #[tokio::test]
    async fn admin_writes_without_token_are_unauthorized() {
        let app = router(Arc::new(ScriptedBackend::default())).await;

        let response = app
            .oneshot(
                Request::delete("/api/admin/tests/t1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn admin_login_is_unavailable_when_not_configured() {
        let app = router(Arc::new(ScriptedBackend::default())).await;

        let response = app
            .oneshot(
                Request::post("/api/admin/login")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"username":"root","password":"pw"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
