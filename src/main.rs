// src/main.rs

use std::sync::Arc;
use std::time::Duration;

use mock_test::config::Config;
use mock_test::routes;
use mock_test::services::backend::{Backend, RestBackend};
use mock_test::state::AppState;
use mock_test::utils::hash::hash_password;
use sqlx::sqlite::SqlitePoolOptions;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Upper bound for a single backend request.
const BACKEND_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration from environment (.env included)
    let mut config = Config::from_env()?;

    let file_appender = tracing_appender::rolling::daily("logs", "app.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::new(&config.rust_log);
    let stdout_layer = fmt::layer().with_writer(std::io::stdout).with_target(false);
    let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

    // Initialize Tracing (Logging)
    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    // Initialize the local cache database with retry
    let mut retry_count = 0;
    let pool = loop {
        match SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(3))
            .connect(&config.cache_database_url)
            .await
        {
            Ok(pool) => break pool,
            Err(e) => {
                retry_count += 1;
                if retry_count > 5 {
                    tracing::error!("Failed to open cache database after 5 retries: {}", e);
                    return Err(e.into());
                }
                tracing::warn!("Cache database not ready, retrying in 2s... (Attempt {})", retry_count);
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    };

    tracing::info!("Cache database opened...");

    // Run Migrations Automatically
    tracing::info!("Running migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    tracing::info!("Migrations applied successfully.");

    seed_admin_password(&mut config);

    let backend: Arc<dyn Backend> = Arc::new(RestBackend::new(
        config.backend_url.as_ref(),
        config.backend_anon_key.clone(),
        config.backend_service_key.clone(),
        BACKEND_REQUEST_TIMEOUT,
    )?);

    let bind_addr = config.bind_addr.clone();
    let state = AppState::new(pool, config, backend);
    let _reconnect_watcher = state.start().await;

    // Create the Axum application router
    let app = routes::create_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("Listening on {}", bind_addr);

    // Start the server
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Server stopped: {}", e);
        return Err(e.into());
    }
    Ok(())
}

/// Hashes `ADMIN_PASSWORD` once when no `ADMIN_PASSWORD_HASH` is configured.
fn seed_admin_password(config: &mut Config) {
    if config.admin_password_hash.is_some() {
        return;
    }
    let Some(password) = config.admin_password.take() else {
        return;
    };

    match hash_password(&password) {
        Ok(hash) => {
            tracing::info!("Admin password hashed from ADMIN_PASSWORD");
            config.admin_password_hash = Some(hash);
        }
        Err(e) => tracing::error!("Failed to hash admin password: {:?}", e),
    }
}
