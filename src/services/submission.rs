// src/services/submission.rs

//! Saving completed attempts exactly once.
//!
//! The remote store is preferred. When it cannot be reached the attempt is
//! queued locally and shown as pending; `resync` drains the queue once
//! connectivity returns.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, watch};

use crate::{
    error::AppError,
    models::{
        attempt::{
            AttemptRecord, HistoryEntry, HistoryStatus, PendingAttempt, TestAttempt, UserAnswer,
        },
        user::AuthSession,
    },
    services::{
        auth::AuthContext,
        backend::{BackendError, BackendFacade},
        cache::{FLAG_HAS_PENDING, GUEST_OWNER, LocalCache},
    },
};

/// Duplicate when ids match, or when test and track match and the
/// timestamps are at most `window` apart.
pub fn is_duplicate(a: &TestAttempt, b: &TestAttempt, window: Duration) -> bool {
    if a.id == b.id {
        return true;
    }
    a.test_id == b.test_id
        && a.track == b.track
        && (a.timestamp - b.timestamp).abs() <= window
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmitOutcome {
    /// Stored remotely and in local history.
    Saved,
    /// An equivalent attempt already exists locally or remotely.
    AlreadyRecorded,
    /// No signed-in user; kept on this device only.
    SavedAsGuest,
    /// Remote store unreachable; queued for resync.
    Queued { reason: String },
    /// Another submission for the same test is still running.
    InFlight,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResyncReport {
    pub synced: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub remaining: i64,
    pub in_progress: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// The pending queue was drained completely.
    Resynced { count: usize },
}

/// Removes the fingerprint from the in-flight set when dropped.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    key: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.key);
        }
    }
}

pub struct AttemptSubmitter {
    cache: LocalCache,
    backend: BackendFacade,
    duplicate_window: Duration,
    in_flight: Mutex<HashSet<String>>,
    resync_lock: tokio::sync::Mutex<()>,
    events: broadcast::Sender<SyncEvent>,
}

impl AttemptSubmitter {
    pub fn new(cache: LocalCache, backend: BackendFacade, duplicate_window: Duration) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            cache,
            backend,
            duplicate_window,
            in_flight: Mutex::new(HashSet::new()),
            resync_lock: tokio::sync::Mutex::new(()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    fn begin(&self, key: String) -> Result<Option<InFlightGuard<'_>>, AppError> {
        let mut set = self
            .in_flight
            .lock()
            .map_err(|_| AppError::InternalServerError("submission guard poisoned".to_string()))?;
        if !set.insert(key.clone()) {
            return Ok(None);
        }
        Ok(Some(InFlightGuard {
            set: &self.in_flight,
            key,
        }))
    }

    pub async fn submit(
        &self,
        attempt: TestAttempt,
        answers: &[UserAnswer],
        session: Option<&AuthSession>,
    ) -> Result<SubmitOutcome, AppError> {
        let problems = attempt.validation_errors();
        if !problems.is_empty() {
            return Err(AppError::BadRequest(problems.join("; ")));
        }

        let Some(_guard) = self.begin(attempt.fingerprint())? else {
            tracing::debug!(attempt_id = %attempt.id, "Submission already in flight, ignoring");
            return Ok(SubmitOutcome::InFlight);
        };

        let owner = session.map_or(GUEST_OWNER, |s| s.user.id.as_str());
        let existing = self.cache.history(owner).await;
        // A signed-in `local` entry was refused by the backend earlier and
        // may be retried.
        if existing
            .iter()
            .filter(|e| session.is_none() || e.status != HistoryStatus::Local)
            .any(|e| is_duplicate(&e.attempt, &attempt, self.duplicate_window))
        {
            tracing::info!(attempt_id = %attempt.id, "Duplicate attempt ignored");
            return Ok(SubmitOutcome::AlreadyRecorded);
        }

        let Some(session) = session else {
            self.cache
                .record_history(GUEST_OWNER, &attempt, HistoryStatus::Local)
                .await;
            tracing::info!(attempt_id = %attempt.id, "Guest attempt saved locally");
            return Ok(SubmitOutcome::SavedAsGuest);
        };

        if !self.backend.is_reachable().await {
            return Ok(self
                .enqueue(session, attempt, answers, "backend unreachable")
                .await);
        }

        let record = AttemptRecord::new(&session.user.id, &attempt, answers);
        match self
            .backend
            .insert_attempt(&session.access_token, &record)
            .await
        {
            Ok(()) => {
                self.cache
                    .record_history(owner, &attempt, HistoryStatus::Synced)
                    .await;
                tracing::info!(attempt_id = %attempt.id, "Attempt saved");
                Ok(SubmitOutcome::Saved)
            }
            Err(BackendError::Duplicate) => {
                tracing::info!(attempt_id = %attempt.id, "Backend already has this attempt");
                self.cache
                    .set_history_status(&attempt.id, HistoryStatus::Synced)
                    .await;
                Ok(SubmitOutcome::AlreadyRecorded)
            }
            Err(e) if e.is_connectivity() => {
                let reason = e.to_string();
                Ok(self.enqueue(session, attempt, answers, &reason).await)
            }
            Err(e) => {
                tracing::error!(attempt_id = %attempt.id, "Attempt rejected by backend: {}", e);
                self.cache
                    .record_history(owner, &attempt, HistoryStatus::Local)
                    .await;
                Err(AppError::from(e))
            }
        }
    }

    async fn enqueue(
        &self,
        session: &AuthSession,
        attempt: TestAttempt,
        answers: &[UserAnswer],
        reason: &str,
    ) -> SubmitOutcome {
        tracing::warn!(attempt_id = %attempt.id, "Queueing attempt for later sync: {}", reason);
        self.cache
            .record_history(&session.user.id, &attempt, HistoryStatus::Pending)
            .await;
        self.cache
            .enqueue_pending(&PendingAttempt {
                attempt,
                answers: answers.to_vec(),
                user_id: session.user.id.clone(),
                enqueued_at: Utc::now(),
            })
            .await;
        self.cache.set_flag(FLAG_HAS_PENDING, "true").await;
        SubmitOutcome::Queued {
            reason: reason.to_string(),
        }
    }

    /// Drains the pending queue in enqueue order.
    ///
    /// Stops at the first failure and keeps that entry and everything after
    /// it. Entries owned by another user are skipped and kept.
    pub async fn resync(&self, session: Option<&AuthSession>) -> Result<ResyncReport, AppError> {
        let Ok(_lock) = self.resync_lock.try_lock() else {
            return Ok(ResyncReport {
                in_progress: true,
                ..ResyncReport::default()
            });
        };

        let queue = self.cache.pending_attempts().await;
        if queue.is_empty() {
            self.cache.clear_flag(FLAG_HAS_PENDING).await;
            return Ok(ResyncReport::default());
        }

        let session = session.ok_or_else(|| {
            AppError::AuthError("Sign in to sync your saved attempts.".to_string())
        })?;

        if !self.backend.is_reachable().await {
            return Err(AppError::Offline(
                "No internet connection. Your attempts are saved and will sync later.".to_string(),
            ));
        }

        let mut report = ResyncReport::default();
        for (seq, pending) in queue {
            if pending.user_id != session.user.id {
                report.skipped += 1;
                continue;
            }

            let record = AttemptRecord::new(&pending.user_id, &pending.attempt, &pending.answers);
            match self
                .backend
                .insert_attempt(&session.access_token, &record)
                .await
            {
                Ok(()) => report.synced += 1,
                Err(BackendError::Duplicate) => report.duplicates += 1,
                Err(e) => {
                    tracing::warn!(
                        attempt_id = %pending.attempt.id,
                        "Resync stopped, keeping remaining attempts: {}",
                        e
                    );
                    break;
                }
            }
            self.cache.remove_pending(seq).await;
            self.cache
                .set_history_status(&pending.attempt.id, HistoryStatus::Synced)
                .await;
        }

        report.remaining = self.cache.pending_count().await;
        if report.remaining == 0 {
            self.cache.clear_flag(FLAG_HAS_PENDING).await;
            let count = report.synced + report.duplicates;
            tracing::info!(count, "Pending attempts synced");
            let _ = self.events.send(SyncEvent::Resynced { count });
        }
        Ok(report)
    }

    /// The signed-in learner's queued attempts, oldest first. Guests
    /// never queue.
    pub async fn pending(&self, session: Option<&AuthSession>) -> Vec<PendingAttempt> {
        let Some(session) = session else {
            return Vec::new();
        };
        self.cache
            .pending_attempts()
            .await
            .into_iter()
            .map(|(_, p)| p)
            .filter(|p| p.user_id == session.user.id)
            .collect()
    }

    pub async fn has_pending(&self, session: Option<&AuthSession>) -> bool {
        let Some(session) = session else {
            return false;
        };
        self.cache.flag_is_set(FLAG_HAS_PENDING).await
            && self.cache.pending_count_for(&session.user.id).await > 0
    }

    /// Local history, topped up from the backend when online.
    ///
    /// A queued attempt the backend already holds is marked `synced` and
    /// leaves the queue.
    pub async fn history(&self, session: Option<&AuthSession>) -> Vec<HistoryEntry> {
        let Some(session) = session else {
            return self.cache.history(GUEST_OWNER).await;
        };
        let owner = session.user.id.as_str();
        let mut local = self.cache.history(owner).await;

        if self.backend.network().is_online() {
            match self
                .backend
                .list_attempts(&session.access_token, owner)
                .await
            {
                Ok(remote) => {
                    for attempt in remote {
                        let matched = local
                            .iter_mut()
                            .find(|e| is_duplicate(&e.attempt, &attempt, self.duplicate_window));
                        if let Some(entry) = matched {
                            if entry.status == HistoryStatus::Pending {
                                tracing::info!(
                                    attempt_id = %entry.attempt.id,
                                    "Queued attempt already on the backend"
                                );
                                self.cache.remove_pending_attempt(&entry.attempt.id).await;
                                self.cache
                                    .set_history_status(&entry.attempt.id, HistoryStatus::Synced)
                                    .await;
                                entry.status = HistoryStatus::Synced;
                            }
                            continue;
                        }
                        self.cache
                            .record_history(owner, &attempt, HistoryStatus::Synced)
                            .await;
                        local.push(HistoryEntry {
                            attempt,
                            status: HistoryStatus::Synced,
                        });
                    }
                }
                Err(e) => tracing::warn!("Could not refresh remote history: {}", e),
            }
        }

        if self.cache.pending_count().await == 0 {
            self.cache.clear_flag(FLAG_HAS_PENDING).await;
        }
        local.sort_by(|a, b| b.attempt.timestamp.cmp(&a.attempt.timestamp));
        local
    }
}

/// Runs `resync` whenever connectivity goes from offline to online.
pub fn spawn_resync_on_reconnect(
    submitter: Arc<AttemptSubmitter>,
    auth: Arc<AuthContext>,
    mut online: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut was_online = *online.borrow_and_update();
        while online.changed().await.is_ok() {
            let now_online = *online.borrow_and_update();
            if now_online && !was_online {
                let session = auth.current_session().await;
                match submitter.resync(session.as_ref()).await {
                    Ok(report) => tracing::info!(?report, "Resync after reconnect"),
                    Err(e) => tracing::warn!("Resync after reconnect failed: {}", e),
                }
            }
            was_online = now_online;
        }
    })
}
