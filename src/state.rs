// src/state.rs

use std::sync::Arc;
use std::time::Duration;

use axum::extract::FromRef;
use sqlx::SqlitePool;

use crate::{
    config::Config,
    services::{
        auth::AuthContext,
        backend::{Backend, BackendFacade},
        cache::LocalCache,
        catalog::TestCatalog,
        network::NetworkMonitor,
        quiz_session::QuizSessionStore,
        submission::{AttemptSubmitter, spawn_resync_on_reconnect},
    },
};

/// Service objects shared by every handler, wired once at startup.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub cache: LocalCache,
    pub network: NetworkMonitor,
    pub backend: BackendFacade,
    pub auth: Arc<AuthContext>,
    pub catalog: Arc<TestCatalog>,
    pub submitter: Arc<AttemptSubmitter>,
    pub quiz: QuizSessionStore,
}

impl AppState {
    pub fn new(pool: SqlitePool, config: Config, backend: Arc<dyn Backend>) -> Self {
        let cache = LocalCache::new(
            pool,
            chrono::Duration::seconds(config.test_cache_ttl_secs),
        );
        let network = NetworkMonitor::new(backend.clone());
        let facade = BackendFacade::new(
            backend,
            network.clone(),
            Duration::from_millis(config.probe_timeout_ms),
        );
        let quiz = QuizSessionStore::default();

        let auth = Arc::new(AuthContext::new(facade.clone(), cache.clone(), quiz.clone()));
        let catalog = Arc::new(TestCatalog::new(cache.clone(), facade.clone()));
        let submitter = Arc::new(AttemptSubmitter::new(
            cache.clone(),
            facade.clone(),
            chrono::Duration::seconds(config.duplicate_window_secs),
        ));

        Self {
            config,
            cache,
            network,
            backend: facade,
            auth,
            catalog,
            submitter,
            quiz,
        }
    }

    /// Restores the persisted auth session and starts the reconnect watcher.
    pub async fn start(&self) -> tokio::task::JoinHandle<()> {
        self.auth.restore().await;
        spawn_resync_on_reconnect(
            self.submitter.clone(),
            self.auth.clone(),
            self.network.subscribe(),
        )
    }
}

impl FromRef<AppState> for Config {
    fn from_ref(state: &AppState) -> Self {
        state.config.clone()
    }
}
