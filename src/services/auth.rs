// src/services/auth.rs

use chrono::Utc;
use tokio::sync::{RwLock, watch};

use crate::{
    error::AppError,
    models::user::{AuthSession, AuthUser},
    services::{
        backend::BackendFacade,
        cache::{FLAG_AUTH_SESSION, LocalCache},
        quiz_session::QuizSessionStore,
    },
};

/// The signed-in learner, shared by every handler.
///
/// The session is mirrored into the local cache so a restart keeps the
/// learner signed in. Subscribers see every sign-in and sign-out.
pub struct AuthContext {
    backend: BackendFacade,
    cache: LocalCache,
    quiz: QuizSessionStore,
    session: RwLock<Option<AuthSession>>,
    changes: watch::Sender<Option<AuthUser>>,
}

impl AuthContext {
    pub fn new(backend: BackendFacade, cache: LocalCache, quiz: QuizSessionStore) -> Self {
        let (changes, _) = watch::channel(None);
        Self {
            backend,
            cache,
            quiz,
            session: RwLock::new(None),
            changes,
        }
    }

    /// Loads the session persisted by a previous run. An expired session
    /// is kept only when it can still be refreshed.
    pub async fn restore(&self) {
        let Some(raw) = self.cache.flag(FLAG_AUTH_SESSION).await else {
            return;
        };
        match serde_json::from_str::<AuthSession>(&raw) {
            Ok(session) if !session.is_expired(Utc::now()) || session.refresh_token.is_some() => {
                tracing::info!(user_id = %session.user.id, "Restored auth session");
                self.set(Some(session)).await;
            }
            Ok(_) => {
                tracing::info!("Stored auth session expired, signing out");
                self.cache.clear_flag(FLAG_AUTH_SESSION).await;
            }
            Err(e) => {
                tracing::warn!("Discarding unreadable auth session: {}", e);
                self.cache.clear_flag(FLAG_AUTH_SESSION).await;
            }
        }
    }

    async fn set(&self, session: Option<AuthSession>) {
        let user = session.as_ref().map(|s| s.user.clone());
        *self.session.write().await = session;
        self.changes.send_replace(user);
    }

    async fn persist(&self, session: &AuthSession) {
        match serde_json::to_string(session) {
            Ok(raw) => self.cache.set_flag(FLAG_AUTH_SESSION, &raw).await,
            Err(e) => tracing::warn!("Failed to persist auth session: {}", e),
        }
    }

    pub async fn sign_up(&self, email: &str, password: &str) -> Result<AuthUser, AppError> {
        let session = self.backend.sign_up(email, password).await?;
        tracing::info!(user_id = %session.user.id, "Signed up");
        self.persist(&session).await;
        let user = session.user.clone();
        self.set(Some(session)).await;
        Ok(user)
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<AuthUser, AppError> {
        let session = self.backend.sign_in(email, password).await?;
        tracing::info!(user_id = %session.user.id, "Signed in");
        self.persist(&session).await;
        let user = session.user.clone();
        self.set(Some(session)).await;
        Ok(user)
    }

    /// Always signs out locally; the remote call is best-effort.
    pub async fn sign_out(&self) {
        let previous = self.session.read().await.clone();
        if let Some(session) = previous {
            if let Err(e) = self.backend.sign_out(&session.access_token).await {
                tracing::warn!("Remote sign-out failed, continuing locally: {}", e);
            }
            tracing::info!(user_id = %session.user.id, "Signed out");
        }
        self.cache.clear_flag(FLAG_AUTH_SESSION).await;
        self.quiz.reset().await;
        self.set(None).await;
    }

    /// The current session, refreshed through the backend once it has
    /// expired.
    ///
    /// While the backend cannot be reached the expired session is returned
    /// as is, so the learner keeps their identity and submissions queue
    /// under it. A refresh token the backend refuses ends the session.
    pub async fn current_session(&self) -> Option<AuthSession> {
        let session = self.session.read().await.clone()?;
        if !session.is_expired(Utc::now()) {
            return Some(session);
        }

        let mut guard = self.session.write().await;
        // Another caller may have refreshed while we waited for the lock
        let session = guard.as_ref()?.clone();
        if !session.is_expired(Utc::now()) {
            return Some(session);
        }
        let Some(refresh_token) = session.refresh_token.clone() else {
            tracing::info!(user_id = %session.user.id, "Auth session expired");
            return None;
        };

        match self.backend.refresh_session(&refresh_token).await {
            Ok(refreshed) => {
                tracing::info!(user_id = %refreshed.user.id, "Refreshed auth session");
                self.persist(&refreshed).await;
                *guard = Some(refreshed.clone());
                Some(refreshed)
            }
            Err(e) if e.is_connectivity() => {
                tracing::debug!("Session refresh deferred while offline: {}", e);
                Some(session)
            }
            Err(e) => {
                tracing::warn!(user_id = %session.user.id, "Session refresh refused: {}", e);
                *guard = None;
                drop(guard);
                self.cache.clear_flag(FLAG_AUTH_SESSION).await;
                self.changes.send_replace(None);
                None
            }
        }
    }

    pub async fn current_user(&self) -> Option<AuthUser> {
        self.current_session().await.map(|s| s.user)
    }

    /// Asks the backend who the token belongs to, falling back to the
    /// cached identity when offline.
    pub async fn verified_user(&self) -> Result<Option<AuthUser>, AppError> {
        let Some(session) = self.current_session().await else {
            return Ok(None);
        };
        match self.backend.current_user(&session.access_token).await {
            Ok(user) => Ok(Some(user)),
            Err(e) if e.is_connectivity() => Ok(Some(session.user)),
            Err(e) => Err(e.into()),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<AuthUser>> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::backend::Backend;
    use crate::services::network::NetworkMonitor;
    use crate::services::test_support::{ScriptedBackend, memory_pool, session_for};
    use std::sync::Arc;

    async fn context(pool: sqlx::SqlitePool) -> AuthContext {
        context_with(pool, Arc::new(ScriptedBackend::default())).await
    }

    async fn context_with(pool: sqlx::SqlitePool, backend: Arc<ScriptedBackend>) -> AuthContext {
        let backend: Arc<dyn Backend> = backend;
        let network = NetworkMonitor::new(backend.clone());
        let facade = BackendFacade::new(backend, network, std::time::Duration::from_millis(200));
        let cache = LocalCache::new(pool, chrono::Duration::hours(1));
        AuthContext::new(facade, cache, QuizSessionStore::default())
    }

    #[tokio::test]
    async fn sign_in_notifies_and_survives_restart() {
        let pool = memory_pool().await;
        let auth = context(pool.clone()).await;
        let mut changes = auth.subscribe();

        let user = auth.sign_in("asha@example.com", "secret123").await.unwrap();
        assert_eq!(user.id, "asha");
        assert!(changes.has_changed().unwrap());
        assert_eq!(changes.borrow_and_update().as_ref().map(|u| u.id.as_str()), Some("asha"));

        let restarted = context(pool).await;
        restarted.restore().await;
        assert_eq!(restarted.current_user().await.map(|u| u.id), Some("asha".to_string()));
    }

    #[tokio::test]
    async fn sign_out_clears_everything() {
        let pool = memory_pool().await;
        let auth = context(pool.clone()).await;
        auth.sign_in("asha@example.com", "secret123").await.unwrap();
        auth.sign_out().await;

        assert!(auth.current_session().await.is_none());
        let restarted = context(pool).await;
        restarted.restore().await;
        assert!(restarted.current_session().await.is_none());
    }

    #[tokio::test]
    async fn bad_credentials_are_an_auth_error() {
        let auth = context(memory_pool().await).await;
        let result = auth.sign_in("asha@example.com", "wrong-password").await;
        assert!(matches!(result, Err(AppError::AuthError(_))));
        assert!(auth.current_session().await.is_none());
    }

    /// Persists an already expired session for "asha", as a previous run
    /// would have left it.
    async fn store_expired_session(pool: &sqlx::SqlitePool, refresh_token: Option<&str>) {
        let mut session = session_for("asha");
        session.expires_at = Some(Utc::now() - chrono::Duration::minutes(5));
        session.refresh_token = refresh_token.map(str::to_string);
        let cache = LocalCache::new(pool.clone(), chrono::Duration::hours(1));
        cache
            .set_flag(FLAG_AUTH_SESSION, &serde_json::to_string(&session).unwrap())
            .await;
    }

    #[tokio::test]
    async fn expired_session_is_refreshed_and_persisted() {
        let pool = memory_pool().await;
        store_expired_session(&pool, Some("refresh-asha")).await;
        let backend = Arc::new(ScriptedBackend::default());
        let auth = context_with(pool.clone(), backend.clone()).await;
        auth.restore().await;

        let session = auth.current_session().await.unwrap();
        assert_eq!(session.user.id, "asha");
        assert!(!session.is_expired(Utc::now()));
        assert_eq!(backend.refresh_calls.load(std::sync::atomic::Ordering::SeqCst), 1);

        // A second read uses the refreshed session without another call
        auth.current_session().await.unwrap();
        assert_eq!(backend.refresh_calls.load(std::sync::atomic::Ordering::SeqCst), 1);

        let restarted = context(pool).await;
        restarted.restore().await;
        let stored = restarted.current_session().await.unwrap();
        assert!(!stored.is_expired(Utc::now()));
    }

    #[tokio::test]
    async fn expired_session_keeps_identity_while_offline() {
        let pool = memory_pool().await;
        store_expired_session(&pool, Some("refresh-asha")).await;
        let backend = Arc::new(ScriptedBackend::default());
        backend.set_reachable(false);
        let auth = context_with(pool, backend.clone()).await;
        auth.restore().await;

        let session = auth.current_session().await.unwrap();
        assert_eq!(session.user.id, "asha");
        assert!(session.is_expired(Utc::now()));

        backend.set_reachable(true);
        let session = auth.current_session().await.unwrap();
        assert!(!session.is_expired(Utc::now()));
    }

    #[tokio::test]
    async fn refused_refresh_signs_out() {
        let pool = memory_pool().await;
        store_expired_session(&pool, Some("revoked")).await;
        let auth = context(pool.clone()).await;
        auth.restore().await;
        let mut changes = auth.subscribe();

        assert!(auth.current_session().await.is_none());
        assert!(changes.borrow_and_update().is_none());

        let restarted = context(pool).await;
        restarted.restore().await;
        assert!(restarted.current_user().await.is_none());
    }

    #[tokio::test]
    async fn expired_session_without_refresh_token_is_dropped_on_restore() {
        let pool = memory_pool().await;
        store_expired_session(&pool, None).await;
        let auth = context(pool).await;
        auth.restore().await;
        assert!(auth.current_session().await.is_none());
    }
}
