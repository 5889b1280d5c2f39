// src/services/catalog.rs

use chrono::Utc;

use crate::{
    error::AppError,
    models::test::{ExamTrack, TestDefinition},
    services::{
        backend::{BackendError, BackendFacade},
        cache::LocalCache,
    },
};

/// Cache-first access to test definitions.
pub struct TestCatalog {
    cache: LocalCache,
    backend: BackendFacade,
}

impl TestCatalog {
    pub fn new(cache: LocalCache, backend: BackendFacade) -> Self {
        Self { cache, backend }
    }

    /// Live tests, newest first, optionally narrowed to one track.
    ///
    /// A fresh cache wins. Otherwise the backend is asked and the cache
    /// refreshed; if that fails whatever is cached is served.
    pub async fn list(&self, track: Option<ExamTrack>) -> Result<Vec<TestDefinition>, AppError> {
        let tests = match self.cache.fresh_tests(Utc::now()).await {
            Some(tests) => tests,
            None => match self.backend.list_tests(true).await {
                Ok(tests) => {
                    self.cache.store_tests(&tests).await;
                    tests
                }
                Err(e) => {
                    let stale = self.cache.all_tests().await;
                    if stale.is_empty() {
                        return Err(e.into());
                    }
                    tracing::warn!("Serving cached tests, backend failed: {}", e);
                    stale
                }
            },
        };

        Ok(tests
            .into_iter()
            .filter(|t| t.is_live)
            .filter(|t| track.is_none_or(|tr| t.track == tr))
            .collect())
    }

    /// One definition. A cached row younger than the TTL wins; otherwise
    /// the backend is asked and a stale row is only served when it fails.
    pub async fn get(&self, id: &str) -> Result<TestDefinition, AppError> {
        if let Some(test) = self.cache.fresh_test(id, Utc::now()).await {
            return Ok(test);
        }
        match self.backend.get_test(id).await {
            Ok(test) => {
                self.cache.put_test(&test).await;
                Ok(test)
            }
            Err(BackendError::NotFound) => {
                self.cache.remove_test(id).await;
                Err(AppError::NotFound(format!("Test '{}' not found", id)))
            }
            Err(e) => match self.cache.cached_test(id).await {
                Some(stale) => {
                    tracing::warn!(test_id = %id, "Serving cached test, backend failed: {}", e);
                    Ok(stale)
                }
                None => Err(e.into()),
            },
        }
    }

    pub async fn create(&self, test: &TestDefinition) -> Result<(), AppError> {
        self.backend.create_test(test).await.map_err(|e| match AppError::from(e) {
            AppError::Conflict(_) => {
                AppError::Conflict(format!("Test '{}' already exists", test.id))
            }
            other => other,
        })?;
        tracing::info!(test_id = %test.id, "Test created");
        self.cache.invalidate_tests().await;
        Ok(())
    }

    pub async fn update(&self, test: &TestDefinition) -> Result<(), AppError> {
        self.backend.update_test(test).await?;
        tracing::info!(test_id = %test.id, "Test updated");
        self.cache.put_test(test).await;
        self.cache.invalidate_tests().await;
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<(), AppError> {
        self.backend.delete_test(id).await?;
        tracing::info!(test_id = %id, "Test deleted");
        self.cache.remove_test(id).await;
        self.cache.invalidate_tests().await;
        Ok(())
    }

    pub async fn set_live(&self, id: &str, is_live: bool) -> Result<(), AppError> {
        self.backend.set_test_live(id, is_live).await?;
        tracing::info!(test_id = %id, is_live, "Test liveness changed");
        self.cache.remove_test(id).await;
        self.cache.invalidate_tests().await;
        Ok(())
    }
}
