// src/services/cache.rs

//! Best-effort local persistence.
//!
//! Reads never fail: a broken row or query is logged and treated as
//! absent. Writes that fail are logged and swallowed so caching never
//! blocks the primary flow. The service is the only writer, so SQLite
//! serialises every write and the last one wins.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Serialize, de::DeserializeOwned};
use sqlx::{FromRow, SqlitePool};

use crate::models::{
    attempt::{HistoryEntry, HistoryStatus, PendingAttempt, TestAttempt},
    test::TestDefinition,
};

pub const FLAG_HAS_PENDING: &str = "has_pending";
pub const FLAG_ADMIN_LOGGED_IN: &str = "admin_logged_in";
pub const FLAG_AUTH_SESSION: &str = "auth_session";
const FLAG_TESTS_CACHED_AT: &str = "tests_cached_at";

/// History owner used when nobody is signed in.
pub const GUEST_OWNER: &str = "__guest__";

#[derive(FromRow)]
struct PayloadRow {
    payload: String,
}

#[derive(FromRow)]
struct CachedTestRow {
    payload: String,
    cached_at: String,
}

#[derive(FromRow)]
struct PendingRow {
    seq: i64,
    payload: String,
}

#[derive(FromRow)]
struct HistoryRow {
    payload: String,
    status: String,
}

#[derive(FromRow)]
struct FlagRow {
    value: String,
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn decode<T: DeserializeOwned>(raw: &str, what: &str) -> Option<T> {
    match serde_json::from_str(raw) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!("Skipping unreadable cached {}: {}", what, e);
            None
        }
    }
}

fn encode<T: Serialize>(value: &T, what: &str) -> Option<String> {
    match serde_json::to_string(value) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::error!("Failed to serialize {} for cache: {}", what, e);
            None
        }
    }
}

#[derive(Clone)]
pub struct LocalCache {
    pool: SqlitePool,
    test_ttl: Duration,
}

impl LocalCache {
    pub fn new(pool: SqlitePool, test_ttl: Duration) -> Self {
        Self { pool, test_ttl }
    }

    // ---- test definitions ----

    /// Replaces the cached catalog and stamps it with the current time.
    pub async fn store_tests(&self, tests: &[TestDefinition]) {
        if let Err(e) = self.try_store_tests(tests).await {
            tracing::warn!("Failed to cache test definitions: {}", e);
        }
    }

    async fn try_store_tests(&self, tests: &[TestDefinition]) -> Result<(), sqlx::Error> {
        let now = timestamp(Utc::now());
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM cached_tests")
            .execute(&mut *tx)
            .await?;
        for test in tests {
            let Some(payload) = encode(test, "test definition") else {
                continue;
            };
            sqlx::query(
                "INSERT INTO cached_tests (id, track, payload, cached_at) VALUES ($1, $2, $3, $4)",
            )
            .bind(&test.id)
            .bind(test.track.as_str())
            .bind(payload)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query(
            r#"
            INSERT INTO session_flags (key, value, updated_at) VALUES ($1, $2, $2)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(FLAG_TESTS_CACHED_AT)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await
    }

    /// Upserts one definition without refreshing the catalog timestamp.
    pub async fn put_test(&self, test: &TestDefinition) {
        let Some(payload) = encode(test, "test definition") else {
            return;
        };
        let result = sqlx::query(
            r#"
            INSERT INTO cached_tests (id, track, payload, cached_at) VALUES ($1, $2, $3, $4)
            ON CONFLICT(id) DO UPDATE SET
                track = excluded.track,
                payload = excluded.payload,
                cached_at = excluded.cached_at
            "#,
        )
        .bind(&test.id)
        .bind(test.track.as_str())
        .bind(payload)
        .bind(timestamp(Utc::now()))
        .execute(&self.pool)
        .await;
        if let Err(e) = result {
            tracing::warn!("Failed to cache test {}: {}", test.id, e);
        }
    }

    /// The cached catalog, only while it is younger than the TTL.
    pub async fn fresh_tests(&self, now: DateTime<Utc>) -> Option<Vec<TestDefinition>> {
        let cached_at = self.flag(FLAG_TESTS_CACHED_AT).await?;
        let cached_at = DateTime::parse_from_rfc3339(&cached_at)
            .ok()?
            .with_timezone(&Utc);
        if now - cached_at >= self.test_ttl {
            return None;
        }
        Some(self.all_tests().await)
    }

    /// Whatever is cached, regardless of age. Newest first.
    pub async fn all_tests(&self) -> Vec<TestDefinition> {
        let rows = sqlx::query_as::<_, PayloadRow>("SELECT payload FROM cached_tests")
            .fetch_all(&self.pool)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!("Failed to read cached tests: {}", e);
                Vec::new()
            });
        let mut tests: Vec<TestDefinition> = rows
            .iter()
            .filter_map(|r| decode(&r.payload, "test definition"))
            .collect();
        tests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tests
    }

    pub async fn cached_test(&self, id: &str) -> Option<TestDefinition> {
        let row = sqlx::query_as::<_, PayloadRow>("SELECT payload FROM cached_tests WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!("Failed to read cached test {}: {}", id, e);
                None
            })?;
        decode(&row.payload, "test definition")
    }

    /// One cached definition, only while its row is younger than the TTL.
    pub async fn fresh_test(&self, id: &str, now: DateTime<Utc>) -> Option<TestDefinition> {
        let row = sqlx::query_as::<_, CachedTestRow>(
            "SELECT payload, cached_at FROM cached_tests WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .unwrap_or_else(|e| {
            tracing::warn!("Failed to read cached test {}: {}", id, e);
            None
        })?;
        let cached_at = DateTime::parse_from_rfc3339(&row.cached_at)
            .ok()?
            .with_timezone(&Utc);
        if now - cached_at >= self.test_ttl {
            return None;
        }
        decode(&row.payload, "test definition")
    }

    /// Marks the catalog stale; rows stay as an offline fallback.
    pub async fn invalidate_tests(&self) {
        self.clear_flag(FLAG_TESTS_CACHED_AT).await;
    }

    pub async fn remove_test(&self, id: &str) {
        let result = sqlx::query("DELETE FROM cached_tests WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await;
        if let Err(e) = result {
            tracing::warn!("Failed to drop cached test {}: {}", id, e);
        }
    }

    // ---- pending attempts ----

    pub async fn enqueue_pending(&self, pending: &PendingAttempt) {
        let Some(payload) = encode(pending, "pending attempt") else {
            return;
        };
        let result = sqlx::query(
            r#"
            INSERT INTO pending_attempts (attempt_id, user_id, payload, enqueued_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&pending.attempt.id)
        .bind(&pending.user_id)
        .bind(payload)
        .bind(timestamp(pending.enqueued_at))
        .execute(&self.pool)
        .await;
        if let Err(e) = result {
            tracing::error!("Failed to queue attempt {}: {}", pending.attempt.id, e);
        }
    }

    /// Queue contents in enqueue order, keyed by sequence number.
    pub async fn pending_attempts(&self) -> Vec<(i64, PendingAttempt)> {
        let rows = sqlx::query_as::<_, PendingRow>(
            "SELECT seq, payload FROM pending_attempts ORDER BY seq ASC",
        )
        .fetch_all(&self.pool)
        .await
        .unwrap_or_else(|e| {
            tracing::warn!("Failed to read pending attempts: {}", e);
            Vec::new()
        });
        rows.into_iter()
            .filter_map(|r| decode(&r.payload, "pending attempt").map(|p| (r.seq, p)))
            .collect()
    }

    /// Queued attempts owned by `user_id`.
    pub async fn pending_count_for(&self, user_id: &str) -> i64 {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM pending_attempts WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!("Failed to count pending attempts of {}: {}", user_id, e);
                0
            })
    }

    pub async fn pending_count(&self) -> i64 {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM pending_attempts")
            .fetch_one(&self.pool)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!("Failed to count pending attempts: {}", e);
                0
            })
    }

    pub async fn remove_pending(&self, seq: i64) {
        let result = sqlx::query("DELETE FROM pending_attempts WHERE seq = $1")
            .bind(seq)
            .execute(&self.pool)
            .await;
        if let Err(e) = result {
            tracing::warn!("Failed to remove pending attempt #{}: {}", seq, e);
        }
    }

    pub async fn remove_pending_attempt(&self, attempt_id: &str) {
        let result = sqlx::query("DELETE FROM pending_attempts WHERE attempt_id = $1")
            .bind(attempt_id)
            .execute(&self.pool)
            .await;
        if let Err(e) = result {
            tracing::warn!("Failed to remove pending attempt {}: {}", attempt_id, e);
        }
    }

    // ---- attempt history ----

    /// Inserts or replaces the entry for `attempt.id`, keeping its owner.

    pub async fn record_history(&self, owner: &str, attempt: &TestAttempt, status: HistoryStatus) {
        let Some(payload) = encode(attempt, "attempt") else {
            return;
        };
        let result = sqlx::query(
            r#"
            INSERT INTO attempt_history (id, owner, test_id, track, payload, status, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT(id) DO UPDATE SET
                payload = excluded.payload,
                status = excluded.status,
                completed_at = excluded.completed_at
            "#,
        )
        .bind(&attempt.id)
        .bind(owner)
        .bind(&attempt.test_id)
        .bind(attempt.track.as_str())
        .bind(payload)
        .bind(status.as_str())
        .bind(timestamp(attempt.timestamp))
        .execute(&self.pool)
        .await;
        if let Err(e) = result {
            tracing::warn!("Failed to record attempt {} in history: {}", attempt.id, e);
        }
    }

    pub async fn set_history_status(&self, attempt_id: &str, status: HistoryStatus) {
        let result = sqlx::query("UPDATE attempt_history SET status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(attempt_id)
            .execute(&self.pool)
            .await;
        if let Err(e) = result {
            tracing::warn!("Failed to update history status of {}: {}", attempt_id, e);
        }
    }

    /// The owner's history, newest first.
    pub async fn history(&self, owner: &str) -> Vec<HistoryEntry> {
        let rows = sqlx::query_as::<_, HistoryRow>(
            r#"
            SELECT payload, status FROM attempt_history
            WHERE owner = $1
            ORDER BY completed_at DESC
            "#,
        )
        .bind(owner)
        .fetch_all(&self.pool)
        .await
        .unwrap_or_else(|e| {
            tracing::warn!("Failed to read attempt history: {}", e);
            Vec::new()
        });
        rows.into_iter()
            .filter_map(|r| {
                decode::<TestAttempt>(&r.payload, "attempt").map(|attempt| HistoryEntry {
                    attempt,
                    status: HistoryStatus::parse(&r.status),
                })
            })
            .collect()
    }

    // ---- session flags ----

    pub async fn flag(&self, key: &str) -> Option<String> {
        sqlx::query_as::<_, FlagRow>("SELECT value FROM session_flags WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!("Failed to read flag {}: {}", key, e);
                None
            })
            .map(|r| r.value)
    }

    pub async fn flag_is_set(&self, key: &str) -> bool {
        self.flag(key).await.as_deref() == Some("true")
    }

    pub async fn set_flag(&self, key: &str, value: &str) {
        let result = sqlx::query(
            r#"
            INSERT INTO session_flags (key, value, updated_at) VALUES ($1, $2, $3)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(timestamp(Utc::now()))
        .execute(&self.pool)
        .await;
        if let Err(e) = result {
            tracing::warn!("Failed to set flag {}: {}", key, e);
        }
    }

    pub async fn clear_flag(&self, key: &str) {
        let result = sqlx::query("DELETE FROM session_flags WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await;
        if let Err(e) = result {
            tracing::warn!("Failed to clear flag {}: {}", key, e);
        }
    }
}
