//! In-memory upload session registry
//!
//! Sessions are keyed by sanitized filename and track which chunk indices
//! have arrived. The registry is authoritative for merge coordination only;
//! the received set can be reseeded from disk, so losing it never loses
//! uploaded data.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use crate::sanitize::SafeFileName;
use crate::upload::types::{SessionStatus, SessionStatusView, UploadError};

// ============================================================================
// Session Data
// ============================================================================

/// State of one upload session
#[derive(Debug)]
struct Session {
    /// Total chunk count, fixed by the first request that created the session
    total_chunks: u64,

    /// Distinct chunk indices received so far
    received: BTreeSet<u64>,

    /// Whether a merge currently holds the claim for this session
    merging: bool,

    /// Most recent merge failure
    last_error: Option<String>,

    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
}

impl Session {
    fn new(total_chunks: u64) -> Self {
        let now = Utc::now();
        Self {
            total_chunks,
            received: BTreeSet::new(),
            merging: false,
            last_error: None,
            created_at: now,
            last_activity: now,
        }
    }

    fn is_complete(&self) -> bool {
        self.received.len() as u64 == self.total_chunks
    }

    /// Count of the contiguous received prefix starting at index 0
    fn prefix_count(&self) -> u64 {
        let mut count = 0;
        for &index in &self.received {
            if index != count {
                break;
            }
            count += 1;
        }
        count
    }
}

/// Progress captured when a chunk is recorded
#[derive(Debug, Clone, Copy)]
pub struct SessionSnapshot {
    /// Distinct indices received
    pub received: u64,

    /// Session total
    pub total: u64,

    /// Whether every index in `0..total` has been received
    pub complete: bool,
}

// ============================================================================
// SessionRegistry
// ============================================================================

/// Shared registry of live upload sessions.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    sessions: RwLock<HashMap<SafeFileName, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Create the session for `name` if absent, or validate it if present.
    ///
    /// The first request to reach the server fixes `total_chunks` for the
    /// session; a later request with a different total is rejected so the
    /// completeness accounting cannot be silently corrupted. Returns whether
    /// the session was newly created, so the caller can reseed it from disk.
    pub async fn ensure(&self, name: &SafeFileName, total: u64) -> Result<bool, UploadError> {
        let mut sessions = self.inner.sessions.write().await;
        match sessions.get(name) {
            Some(session) if session.total_chunks != total => {
                Err(UploadError::TotalChunksMismatch {
                    expected: session.total_chunks,
                    got: total,
                })
            }
            Some(_) => Ok(false),
            None => {
                sessions.insert(name.clone(), Session::new(total));
                tracing::info!(file_name = %name, total_chunks = total, "created upload session");
                Ok(true)
            }
        }
    }

    /// Union-merge indices found on disk into the received set.
    pub async fn seed(&self, name: &SafeFileName, indices: BTreeSet<u64>) {
        let mut sessions = self.inner.sessions.write().await;
        if let Some(session) = sessions.get_mut(name) {
            if !indices.is_empty() {
                tracing::info!(
                    file_name = %name,
                    reseeded = indices.len(),
                    "reseeded session from disk"
                );
            }
            session.received.extend(indices);
        }
    }

    /// Record a chunk arrival and report the session's progress.
    pub async fn mark_received(
        &self,
        name: &SafeFileName,
        index: u64,
    ) -> Result<SessionSnapshot, UploadError> {
        let mut sessions = self.inner.sessions.write().await;
        let session = sessions.get_mut(name).ok_or(UploadError::SessionNotFound)?;

        session.received.insert(index);
        session.last_activity = Utc::now();

        Ok(SessionSnapshot {
            received: session.received.len() as u64,
            total: session.total_chunks,
            complete: session.is_complete(),
        })
    }

    /// Claim the merge for a complete session.
    ///
    /// Returns true for exactly one caller at a time: the claim holds until
    /// `complete` or `fail_merge` releases it, so concurrent completion
    /// triggers cannot start overlapping merges.
    pub async fn try_claim_merge(&self, name: &SafeFileName) -> bool {
        let mut sessions = self.inner.sessions.write().await;
        match sessions.get_mut(name) {
            Some(session) if session.is_complete() && !session.merging => {
                session.merging = true;
                true
            }
            _ => false,
        }
    }

    /// Remove the session after a successful merge.
    pub async fn complete(&self, name: &SafeFileName) {
        let mut sessions = self.inner.sessions.write().await;
        if sessions.remove(name).is_some() {
            tracing::info!(file_name = %name, "upload session completed");
        }
    }

    /// Release the merge claim after a failure.
    ///
    /// The session returns to receiving with the failure recorded, so a
    /// retried chunk can trigger the merge again.
    pub async fn fail_merge(&self, name: &SafeFileName, reason: &str) {
        let mut sessions = self.inner.sessions.write().await;
        if let Some(session) = sessions.get_mut(name) {
            session.merging = false;
            session.last_error = Some(reason.to_string());
        }
    }

    /// Remove a session without touching its artifacts.
    pub async fn remove(&self, name: &SafeFileName) {
        let mut sessions = self.inner.sessions.write().await;
        sessions.remove(name);
    }

    /// Status view of a live session.
    pub async fn view(&self, name: &SafeFileName) -> Option<SessionStatusView> {
        let sessions = self.inner.sessions.read().await;
        let session = sessions.get(name)?;

        let status = if session.merging {
            SessionStatus::Merging
        } else {
            SessionStatus::Receiving
        };

        Some(SessionStatusView {
            file_name: name.as_str().to_string(),
            status,
            complete: session.is_complete(),
            received_chunks: Some(session.received.len() as u64),
            total_chunks: Some(session.total_chunks),
            last_error: session.last_error.clone(),
            created_at: Some(session.created_at),
            last_activity: Some(session.last_activity),
        })
    }

    /// `(prefix, received, total)` counts for a live session.
    pub async fn counts(&self, name: &SafeFileName) -> Option<(u64, u64, u64)> {
        let sessions = self.inner.sessions.read().await;
        let session = sessions.get(name)?;
        Some((
            session.prefix_count(),
            session.received.len() as u64,
            session.total_chunks,
        ))
    }

    /// Sessions idle longer than `ttl`, with their totals.
    ///
    /// Sessions holding a merge claim are never reported; the merge outcome
    /// decides their fate.
    pub async fn expired(&self, ttl: Duration) -> Vec<(SafeFileName, u64)> {
        let cutoff = Utc::now() - ttl;
        let sessions = self.inner.sessions.read().await;
        sessions
            .iter()
            .filter(|(_, session)| !session.merging && session.last_activity < cutoff)
            .map(|(name, session)| (name.clone(), session.total_chunks))
            .collect()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
