//! Upload orchestration
//!
//! Ties the chunk store, session registry, and reassembler together: one
//! `ingest` call validates, persists, records, and triggers the merge when
//! the session becomes complete. Also answers the progress and status
//! queries and runs the expiry sweeper.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use futures::future::join_all;
use tokio::task::JoinHandle;

use crate::sanitize::SafeFileName;
use crate::upload::chunk_store::ChunkStore;
use crate::upload::reassembler::Reassembler;
use crate::upload::session::SessionRegistry;
use crate::upload::types::{
    ChunkReceipt, ProgressReport, SessionStatus, SessionStatusView, UploadError,
};

/// Coordinates chunk ingestion, reassembly, and cleanup.
#[derive(Clone)]
pub struct UploadCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    store: ChunkStore,
    sessions: SessionRegistry,
    reassembler: Reassembler,
    session_ttl: Duration,
}

impl UploadCoordinator {
    pub fn new(store: ChunkStore, session_ttl: Duration) -> Self {
        let reassembler = Reassembler::new(store.clone());
        Self {
            inner: Arc::new(CoordinatorInner {
                store,
                sessions: SessionRegistry::new(),
                reassembler,
                session_ttl,
            }),
        }
    }

    // ========================================================================
    // Ingestion
    // ========================================================================

    /// Ingest one chunk.
    ///
    /// Validation happens before any storage side effect. When the chunk
    /// completes the session, exactly one request wins the merge claim and
    /// runs the reassembly; concurrent triggers receive `merged: false`. A
    /// merge failure is returned to the triggering request and recorded on
    /// the session, and any later chunk re-upload attempts the merge again.
    pub async fn ingest(
        &self,
        name: &SafeFileName,
        chunk_index: u64,
        chunks: u64,
        data: &[u8],
    ) -> Result<ChunkReceipt, UploadError> {
        if chunks == 0 {
            return Err(UploadError::InvalidTotalChunks);
        }
        if chunk_index >= chunks {
            return Err(UploadError::ChunkIndexOutOfBounds {
                index: chunk_index,
                total: chunks,
            });
        }

        let created = self.inner.sessions.ensure(name, chunks).await?;
        if created {
            // chunks may already exist on disk from before a restart
            let on_disk = self.inner.store.scan_received(name, chunks).await;
            self.inner.sessions.seed(name, on_disk).await;
        }

        self.inner.store.put_chunk(name, chunk_index, data).await?;
        let snapshot = self.inner.sessions.mark_received(name, chunk_index).await?;

        let mut merged = false;
        if snapshot.complete && self.inner.sessions.try_claim_merge(name).await {
            match self.inner.reassembler.merge(name, chunks).await {
                Ok(_) => {
                    self.inner.sessions.complete(name).await;
                    merged = true;
                }
                Err(err) => {
                    tracing::error!(file_name = %name, error = %err, "merge failed");
                    self.inner.sessions.fail_merge(name, &err.to_string()).await;
                    return Err(err);
                }
            }
        }

        Ok(ChunkReceipt {
            chunk_index,
            chunks,
            received: snapshot.received,
            complete: snapshot.complete,
            merged,
        })
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Upload progress for a filename.
    ///
    /// Served from the live session when one exists, otherwise from a disk
    /// scan, so the answer survives a registry loss.
    pub async fn progress(&self, name: &SafeFileName) -> ProgressReport {
        if let Some((prefix, received, total)) = self.inner.sessions.counts(name).await {
            return ProgressReport {
                uploaded_chunks: prefix,
                received_chunks: received,
                total_chunks: Some(total),
            };
        }

        ProgressReport {
            uploaded_chunks: self.inner.store.prefix_count(name).await,
            received_chunks: self.inner.store.count_parts(name).await,
            total_chunks: None,
        }
    }

    /// Session status for a filename.
    ///
    /// A filename with neither a live session nor a published final artifact
    /// is not found.
    pub async fn status(&self, name: &SafeFileName) -> Result<SessionStatusView, UploadError> {
        if let Some(view) = self.inner.sessions.view(name).await {
            return Ok(view);
        }

        if self.inner.store.final_exists(name).await {
            return Ok(SessionStatusView {
                file_name: name.as_str().to_string(),
                status: SessionStatus::Complete,
                complete: true,
                received_chunks: None,
                total_chunks: None,
                last_error: None,
                created_at: None,
                last_activity: None,
            });
        }

        Err(UploadError::SessionNotFound)
    }

    // ========================================================================
    // Expiry sweep
    // ========================================================================

    /// Purge sessions idle beyond the TTL and collect stale temp files.
    ///
    /// Returns the number of sessions purged.
    pub async fn sweep_expired(&self) -> usize {
        let stale = self.inner.sessions.expired(self.inner.session_ttl).await;
        let purged = stale.len();

        let purges = stale.into_iter().map(|(name, total)| {
            let store = self.inner.store.clone();
            let sessions = self.inner.sessions.clone();
            async move {
                let removed = store.purge_session(&name, total).await;
                sessions.remove(&name).await;
                tracing::info!(
                    file_name = %name,
                    chunks_removed = removed,
                    "purged expired upload session"
                );
            }
        });
        join_all(purges).await;

        let temp_cutoff = self
            .inner
            .session_ttl
            .to_std()
            .unwrap_or(StdDuration::ZERO);
        let temps = self.inner.store.sweep_stale_temps(temp_cutoff).await;
        if purged > 0 || temps > 0 {
            tracing::info!(sessions = purged, temps, "expiry sweep finished");
        }

        purged
    }

    /// Spawn the periodic background sweep.
    pub fn spawn_sweeper(self, interval: StdDuration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // the first tick fires immediately; skip it
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.sweep_expired().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn name(raw: &str) -> SafeFileName {
        SafeFileName::parse(raw).unwrap()
    }

    async fn coordinator_with_ttl(ttl: Duration) -> (TempDir, ChunkStore, UploadCoordinator) {
        let dir = TempDir::new().unwrap();
        let store = ChunkStore::open(dir.path()).await.unwrap();
        let coordinator = UploadCoordinator::new(store.clone(), ttl);
        (dir, store, coordinator)
    }

    async fn coordinator() -> (TempDir, ChunkStore, UploadCoordinator) {
        coordinator_with_ttl(Duration::hours(24)).await
    }

    #[tokio::test]
    async fn out_of_order_chunks_assemble_in_index_order() {
        let (dir, store, coordinator) = coordinator().await;
        let file_name = name("movie.mkv");

        let receipt = coordinator.ingest(&file_name, 2, 3, b"CC").await.unwrap();
        assert!(!receipt.complete);
        assert!(!receipt.merged);

        coordinator.ingest(&file_name, 0, 3, b"AA").await.unwrap();
        let receipt = coordinator.ingest(&file_name, 1, 3, b"BB").await.unwrap();
        assert!(receipt.complete);
        assert!(receipt.merged);
        assert_eq!(receipt.received, 3);

        assert_eq!(
            std::fs::read(dir.path().join("movie.mkv")).unwrap(),
            b"AABBCC"
        );
        assert_eq!(store.count_parts(&file_name).await, 0);
    }

    #[tokio::test]
    async fn validation_rejects_before_any_storage_side_effect() {
        let (_dir, store, coordinator) = coordinator().await;
        let file_name = name("movie.mkv");

        let err = coordinator.ingest(&file_name, 0, 0, b"x").await.unwrap_err();
        assert!(matches!(err, UploadError::InvalidTotalChunks));

        let err = coordinator.ingest(&file_name, 3, 3, b"x").await.unwrap_err();
        assert!(matches!(
            err,
            UploadError::ChunkIndexOutOfBounds { index: 3, total: 3 }
        ));

        assert_eq!(store.count_parts(&file_name).await, 0);
    }

    #[tokio::test]
    async fn conflicting_total_is_rejected_without_storing() {
        let (_dir, store, coordinator) = coordinator().await;
        let file_name = name("movie.mkv");

        coordinator.ingest(&file_name, 0, 3, b"AA").await.unwrap();
        let err = coordinator.ingest(&file_name, 1, 4, b"BB").await.unwrap_err();
        assert!(matches!(
            err,
            UploadError::TotalChunksMismatch {
                expected: 3,
                got: 4
            }
        ));

        assert_eq!(store.count_parts(&file_name).await, 1);
    }

    #[tokio::test]
    async fn repeated_upload_of_one_index_does_not_complete_the_session() {
        let (_dir, _store, coordinator) = coordinator().await;
        let file_name = name("movie.mkv");

        for _ in 0..3 {
            let receipt = coordinator.ingest(&file_name, 0, 2, b"AA").await.unwrap();
            assert_eq!(receipt.received, 1);
            assert!(!receipt.complete);
        }
    }

    #[tokio::test]
    async fn concurrent_same_index_uploads_leave_one_intact_payload() {
        let (_dir, store, coordinator) = coordinator().await;
        let file_name = name("movie.mkv");

        let payloads: Vec<Vec<u8>> = (0..8u8).map(|i| vec![i; 4096]).collect();
        let uploads = payloads.iter().map(|payload| {
            let coordinator = coordinator.clone();
            let file_name = file_name.clone();
            let payload = payload.clone();
            tokio::spawn(async move { coordinator.ingest(&file_name, 0, 2, &payload).await })
        });
        for handle in join_all(uploads).await {
            handle.unwrap().unwrap();
        }

        let mut file = store.open_chunk(&file_name, 0).await.unwrap();
        let mut contents = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut file, &mut contents)
            .await
            .unwrap();
        assert_eq!(contents.len(), 4096);
        assert!(payloads.contains(&contents));
    }

    #[tokio::test]
    async fn concurrent_completion_triggers_merge_exactly_once() {
        let (dir, _store, coordinator) = coordinator().await;
        let file_name = name("movie.mkv");

        coordinator.ingest(&file_name, 0, 2, b"AA").await.unwrap();

        // race several uploads of the final missing chunk
        let uploads = (0..8).map(|_| {
            let coordinator = coordinator.clone();
            let file_name = file_name.clone();
            tokio::spawn(async move { coordinator.ingest(&file_name, 1, 2, b"BB").await })
        });

        let mut merged_count = 0;
        for handle in join_all(uploads).await {
            if handle.unwrap().unwrap().merged {
                merged_count += 1;
            }
        }

        assert_eq!(merged_count, 1);
        assert_eq!(
            std::fs::read(dir.path().join("movie.mkv")).unwrap(),
            b"AABB"
        );
    }

    #[tokio::test]
    async fn failed_merge_is_surfaced_and_retryable() {
        let (dir, store, coordinator) = coordinator().await;
        let file_name = name("movie.mkv");

        coordinator.ingest(&file_name, 0, 2, b"AA").await.unwrap();
        // sabotage the session behind the registry's back
        store.delete_chunk(&file_name, 0).await.unwrap();

        let err = coordinator.ingest(&file_name, 1, 2, b"BB").await.unwrap_err();
        assert!(matches!(err, UploadError::ChunkMissing { index: 0, .. }));

        let status = coordinator.status(&file_name).await.unwrap();
        assert_eq!(status.status, SessionStatus::Receiving);
        assert!(status.last_error.is_some());

        // re-uploading the missing chunk re-triggers the merge
        let receipt = coordinator.ingest(&file_name, 0, 2, b"AA").await.unwrap();
        assert!(receipt.merged);
        assert_eq!(
            std::fs::read(dir.path().join("movie.mkv")).unwrap(),
            b"AABB"
        );
    }

    #[tokio::test]
    async fn progress_tracks_prefix_and_true_count() {
        let (_dir, _store, coordinator) = coordinator().await;
        let file_name = name("movie.mkv");

        coordinator.ingest(&file_name, 0, 4, b"AA").await.unwrap();
        coordinator.ingest(&file_name, 2, 4, b"CC").await.unwrap();

        let progress = coordinator.progress(&file_name).await;
        assert_eq!(progress.uploaded_chunks, 1);
        assert_eq!(progress.received_chunks, 2);
        assert_eq!(progress.total_chunks, Some(4));
    }

    #[tokio::test]
    async fn progress_falls_back_to_disk_without_a_session() {
        let (_dir, store, coordinator) = coordinator().await;
        let file_name = name("movie.mkv");

        store.put_chunk(&file_name, 0, b"AA").await.unwrap();
        store.put_chunk(&file_name, 1, b"BB").await.unwrap();
        store.put_chunk(&file_name, 3, b"DD").await.unwrap();

        let progress = coordinator.progress(&file_name).await;
        assert_eq!(progress.uploaded_chunks, 2);
        assert_eq!(progress.received_chunks, 3);
        assert_eq!(progress.total_chunks, None);
    }

    #[tokio::test]
    async fn progress_for_an_unknown_filename_is_zero() {
        let (_dir, _store, coordinator) = coordinator().await;

        let progress = coordinator.progress(&name("nothing.bin")).await;
        assert_eq!(progress.uploaded_chunks, 0);
        assert_eq!(progress.received_chunks, 0);
        assert_eq!(progress.total_chunks, None);
    }

    #[tokio::test]
    async fn ingest_reseeds_a_session_from_disk() {
        let (dir, store, coordinator) = coordinator().await;
        let file_name = name("movie.mkv");

        // chunk 0 predates the registry, as after a restart
        store.put_chunk(&file_name, 0, b"AA").await.unwrap();

        let receipt = coordinator.ingest(&file_name, 1, 2, b"BB").await.unwrap();
        assert!(receipt.complete);
        assert!(receipt.merged);
        assert_eq!(
            std::fs::read(dir.path().join("movie.mkv")).unwrap(),
            b"AABB"
        );
    }

    #[tokio::test]
    async fn status_reports_live_then_completed_sessions() {
        let (_dir, _store, coordinator) = coordinator().await;
        let file_name = name("movie.mkv");

        let err = coordinator.status(&file_name).await.unwrap_err();
        assert!(matches!(err, UploadError::SessionNotFound));

        coordinator.ingest(&file_name, 0, 2, b"AA").await.unwrap();
        let status = coordinator.status(&file_name).await.unwrap();
        assert_eq!(status.status, SessionStatus::Receiving);
        assert_eq!(status.received_chunks, Some(1));
        assert_eq!(status.total_chunks, Some(2));

        coordinator.ingest(&file_name, 1, 2, b"BB").await.unwrap();
        let status = coordinator.status(&file_name).await.unwrap();
        assert_eq!(status.status, SessionStatus::Complete);
        assert!(status.complete);
    }

    #[tokio::test]
    async fn sweep_purges_idle_sessions_and_their_chunks() {
        let (_dir, store, coordinator) = coordinator_with_ttl(Duration::seconds(-1)).await;
        let file_name = name("movie.mkv");

        coordinator.ingest(&file_name, 0, 3, b"AA").await.unwrap();
        coordinator.ingest(&file_name, 2, 3, b"CC").await.unwrap();

        let purged = coordinator.sweep_expired().await;
        assert_eq!(purged, 1);
        assert_eq!(store.count_parts(&file_name).await, 0);

        let err = coordinator.status(&file_name).await.unwrap_err();
        assert!(matches!(err, UploadError::SessionNotFound));
    }

    #[tokio::test]
    async fn sweep_leaves_active_sessions_alone() {
        let (_dir, store, coordinator) = coordinator().await;
        let file_name = name("movie.mkv");

        coordinator.ingest(&file_name, 0, 3, b"AA").await.unwrap();

        let purged = coordinator.sweep_expired().await;
        assert_eq!(purged, 0);
        assert_eq!(store.count_parts(&file_name).await, 1);
    }
}
