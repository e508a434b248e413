//! Filesystem-backed chunk persistence
//!
//! Chunk artifacts live under a `chunks/` subdirectory of the upload root as
//! `<name>.<index>.part`; the reassembled file is published at the root under
//! its bare name. The subdirectory plus the `.part` suffix keep the two key
//! spaces from ever colliding.
//!
//! All writes go through a uniquely named temp file in the same directory
//! followed by a rename, so observers never see a partially written artifact
//! and concurrent writers race at whole-file granularity.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::sanitize::SafeFileName;
use crate::upload::types::UploadError;

/// Name of the subdirectory holding chunk artifacts
const PARTS_DIR: &str = "chunks";

/// Suffix shared by every temp file so the sweeper can recognize them
const TEMP_SUFFIX: &str = ".tmp";

// ============================================================================
// ChunkStore
// ============================================================================

/// Filesystem chunk store rooted at an upload directory.
#[derive(Clone)]
pub struct ChunkStore {
    inner: Arc<ChunkStoreInner>,
}

struct ChunkStoreInner {
    base_dir: PathBuf,
    parts_dir: PathBuf,
}

impl ChunkStore {
    /// Open a store rooted at `base`, creating the directory layout if needed.
    pub async fn open(base: impl Into<PathBuf>) -> Result<Self, UploadError> {
        let base_dir = base.into();
        let parts_dir = base_dir.join(PARTS_DIR);
        fs::create_dir_all(&parts_dir).await?;

        tracing::debug!(base_dir = %base_dir.display(), "opened chunk store");

        Ok(Self {
            inner: Arc::new(ChunkStoreInner {
                base_dir,
                parts_dir,
            }),
        })
    }

    fn part_path(&self, name: &SafeFileName, index: u64) -> PathBuf {
        self.inner
            .parts_dir
            .join(format!("{}.{}.part", name.as_str(), index))
    }

    fn final_path(&self, name: &SafeFileName) -> PathBuf {
        self.inner.base_dir.join(name.as_str())
    }

    // ========================================================================
    // Chunk artifacts
    // ========================================================================

    /// Persist one chunk atomically, returning the number of bytes written.
    ///
    /// Re-uploads of the same `(name, index)` are last-write-wins: the rename
    /// replaces the previous artifact in one step, and a failure anywhere
    /// before the rename leaves the previous artifact untouched.
    pub async fn put_chunk(
        &self,
        name: &SafeFileName,
        index: u64,
        data: &[u8],
    ) -> Result<u64, UploadError> {
        let temp_path = self.inner.parts_dir.join(format!(
            "{}.{}.part.{}{}",
            name.as_str(),
            index,
            Uuid::new_v4(),
            TEMP_SUFFIX
        ));

        if let Err(err) = self.write_temp(&temp_path, data).await {
            if let Err(cleanup_err) = fs::remove_file(&temp_path).await {
                if cleanup_err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(
                        temp = %temp_path.display(),
                        error = %cleanup_err,
                        "failed to remove temp file after write error"
                    );
                }
            }
            return Err(err);
        }

        let part_path = self.part_path(name, index);
        if let Err(err) = fs::rename(&temp_path, &part_path).await {
            if let Err(cleanup_err) = fs::remove_file(&temp_path).await {
                tracing::warn!(
                    temp = %temp_path.display(),
                    error = %cleanup_err,
                    "failed to remove temp file after rename error"
                );
            }
            return Err(UploadError::Storage(err));
        }

        tracing::debug!(
            file_name = %name,
            chunk_index = index,
            bytes = data.len(),
            "stored chunk"
        );

        Ok(data.len() as u64)
    }

    async fn write_temp(&self, temp_path: &Path, data: &[u8]) -> Result<(), UploadError> {
        let mut file = File::create(temp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Whether a chunk artifact is present.
    ///
    /// Absent and unreadable both report `false`; the merge path reports the
    /// precise failing index through `open_chunk` instead.
    pub async fn exists(&self, name: &SafeFileName, index: u64) -> bool {
        match fs::metadata(self.part_path(name, index)).await {
            Ok(meta) => meta.is_file(),
            Err(_) => false,
        }
    }

    /// Open a chunk artifact for reading.
    pub async fn open_chunk(&self, name: &SafeFileName, index: u64) -> Result<File, UploadError> {
        File::open(self.part_path(name, index))
            .await
            .map_err(|source| UploadError::ChunkMissing { index, source })
    }

    /// Delete a chunk artifact.
    pub async fn delete_chunk(&self, name: &SafeFileName, index: u64) -> Result<(), UploadError> {
        fs::remove_file(self.part_path(name, index)).await?;
        Ok(())
    }

    // ========================================================================
    // Disk scans
    // ========================================================================

    /// Scan which of the indices `0..total` have artifacts on disk.
    ///
    /// Used to reseed a session after the in-memory registry is lost, so the
    /// filesystem stays the source of truth across restarts.
    pub async fn scan_received(&self, name: &SafeFileName, total: u64) -> BTreeSet<u64> {
        let mut received = BTreeSet::new();
        for index in 0..total {
            if self.exists(name, index).await {
                received.insert(index);
            }
        }
        received
    }

    /// Count the contiguous prefix of chunk artifacts starting at index 0.
    ///
    /// Stops at the first missing index, so a chunk at index 5 contributes
    /// nothing while index 3 is absent.
    pub async fn prefix_count(&self, name: &SafeFileName) -> u64 {
        let mut count = 0;
        while self.exists(name, count).await {
            count += 1;
        }
        count
    }

    /// Count all chunk artifacts for a filename, contiguous or not.
    pub async fn count_parts(&self, name: &SafeFileName) -> u64 {
        let prefix = format!("{}.", name.as_str());
        let mut count = 0;

        let mut entries = match fs::read_dir(&self.inner.parts_dir).await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(error = %err, "failed to read chunk directory");
                return 0;
            }
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            let Some(rest) = file_name.strip_prefix(&prefix) else {
                continue;
            };
            let Some(index) = rest.strip_suffix(".part") else {
                continue;
            };
            if !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()) {
                count += 1;
            }
        }

        count
    }

    /// Whether a published final artifact exists for this filename.
    pub async fn final_exists(&self, name: &SafeFileName) -> bool {
        match fs::metadata(self.final_path(name)).await {
            Ok(meta) => meta.is_file(),
            Err(_) => false,
        }
    }

    // ========================================================================
    // Final artifact staging
    // ========================================================================

    /// Open a staged output file for reassembly.
    ///
    /// The staged file lives in the chunk directory under a unique temp name;
    /// nothing is visible at the final path until `publish_final` renames it.
    pub async fn stage_final(&self, name: &SafeFileName) -> Result<StagedFinal, UploadError> {
        let temp_path = self.inner.parts_dir.join(format!(
            "{}.assembling.{}{}",
            name.as_str(),
            Uuid::new_v4(),
            TEMP_SUFFIX
        ));
        let file = File::create(&temp_path).await?;

        Ok(StagedFinal {
            file,
            temp_path,
            final_path: self.final_path(name),
        })
    }

    /// Publish a staged final artifact with an atomic rename.
    pub async fn publish_final(&self, staged: StagedFinal) -> Result<PathBuf, UploadError> {
        staged.file.sync_all().await?;
        drop(staged.file);

        if let Err(err) = fs::rename(&staged.temp_path, &staged.final_path).await {
            if let Err(cleanup_err) = fs::remove_file(&staged.temp_path).await {
                tracing::warn!(
                    temp = %staged.temp_path.display(),
                    error = %cleanup_err,
                    "failed to remove staged file after publish error"
                );
            }
            return Err(UploadError::Storage(err));
        }

        Ok(staged.final_path)
    }

    /// Remove a staged final artifact after a failed reassembly.
    pub async fn discard_final(&self, staged: StagedFinal) {
        drop(staged.file);
        if let Err(err) = fs::remove_file(&staged.temp_path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    temp = %staged.temp_path.display(),
                    error = %err,
                    "failed to remove staged file"
                );
            }
        }
    }

    // ========================================================================
    // Cleanup
    // ========================================================================

    /// Best-effort removal of every chunk artifact for a session.
    ///
    /// Returns the number of artifacts removed. Individual failures are
    /// logged and skipped.
    pub async fn purge_session(&self, name: &SafeFileName, total: u64) -> u64 {
        let mut removed = 0;
        for index in 0..total {
            match fs::remove_file(self.part_path(name, index)).await {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    tracing::warn!(
                        file_name = %name,
                        chunk_index = index,
                        error = %err,
                        "failed to remove chunk artifact"
                    );
                }
            }
        }
        removed
    }

    /// Remove temp files older than `older_than`.
    ///
    /// Cancelled or crashed writes leave uniquely named temp files behind;
    /// this collects them once they can no longer belong to a live request.
    pub async fn sweep_stale_temps(&self, older_than: Duration) -> u64 {
        let mut removed = 0;

        let mut entries = match fs::read_dir(&self.inner.parts_dir).await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(error = %err, "failed to read chunk directory");
                return 0;
            }
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if !file_name.ends_with(TEMP_SUFFIX) {
                continue;
            }

            let stale = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(modified) => modified
                    .elapsed()
                    .map(|age| age >= older_than)
                    .unwrap_or(false),
                Err(_) => false,
            };
            if !stale {
                continue;
            }

            match fs::remove_file(entry.path()).await {
                Ok(()) => {
                    tracing::debug!(temp = file_name, "removed stale temp file");
                    removed += 1;
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    tracing::warn!(temp = file_name, error = %err, "failed to remove stale temp file");
                }
            }
        }

        removed
    }
}

/// An in-progress final artifact, not yet visible at its published path.
pub struct StagedFinal {
    file: File,
    temp_path: PathBuf,
    final_path: PathBuf,
}

impl StagedFinal {
    /// Writer for appending reassembled bytes
    pub fn writer(&mut self) -> &mut File {
        &mut self.file
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn name(raw: &str) -> SafeFileName {
        SafeFileName::parse(raw).unwrap()
    }

    async fn store() -> (TempDir, ChunkStore) {
        let dir = TempDir::new().unwrap();
        let store = ChunkStore::open(dir.path()).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn put_then_open_roundtrips() {
        let (_dir, store) = store().await;
        let file_name = name("video.mp4");

        let written = store.put_chunk(&file_name, 0, b"hello").await.unwrap();
        assert_eq!(written, 5);
        assert!(store.exists(&file_name, 0).await);

        let mut file = store.open_chunk(&file_name, 0).await.unwrap();
        let mut contents = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut file, &mut contents)
            .await
            .unwrap();
        assert_eq!(contents, b"hello");
    }

    #[tokio::test]
    async fn overwrite_is_last_write_wins() {
        let (_dir, store) = store().await;
        let file_name = name("video.mp4");

        store.put_chunk(&file_name, 0, b"first").await.unwrap();
        store.put_chunk(&file_name, 0, b"second").await.unwrap();

        let mut file = store.open_chunk(&file_name, 0).await.unwrap();
        let mut contents = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut file, &mut contents)
            .await
            .unwrap();
        assert_eq!(contents, b"second");
    }

    #[tokio::test]
    async fn put_leaves_no_temp_files() {
        let (dir, store) = store().await;
        let file_name = name("video.mp4");

        store.put_chunk(&file_name, 0, b"data").await.unwrap();

        let mut entries = std::fs::read_dir(dir.path().join(PARTS_DIR))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        entries.sort();
        assert_eq!(entries, vec!["video.mp4.0.part"]);
    }

    #[tokio::test]
    async fn missing_chunk_is_not_present() {
        let (_dir, store) = store().await;
        let file_name = name("video.mp4");

        assert!(!store.exists(&file_name, 7).await);
        let err = store.open_chunk(&file_name, 7).await.unwrap_err();
        assert!(matches!(err, UploadError::ChunkMissing { index: 7, .. }));
    }

    #[tokio::test]
    async fn delete_removes_the_artifact() {
        let (_dir, store) = store().await;
        let file_name = name("video.mp4");

        store.put_chunk(&file_name, 0, b"data").await.unwrap();
        store.delete_chunk(&file_name, 0).await.unwrap();
        assert!(!store.exists(&file_name, 0).await);
    }

    #[tokio::test]
    async fn prefix_count_stops_at_the_first_gap() {
        let (_dir, store) = store().await;
        let file_name = name("video.mp4");

        store.put_chunk(&file_name, 0, b"a").await.unwrap();
        store.put_chunk(&file_name, 1, b"b").await.unwrap();
        store.put_chunk(&file_name, 3, b"d").await.unwrap();

        assert_eq!(store.prefix_count(&file_name).await, 2);
        assert_eq!(store.count_parts(&file_name).await, 3);
    }

    #[tokio::test]
    async fn scan_received_reports_indices_on_disk() {
        let (_dir, store) = store().await;
        let file_name = name("video.mp4");

        store.put_chunk(&file_name, 1, b"b").await.unwrap();
        store.put_chunk(&file_name, 3, b"d").await.unwrap();

        let received = store.scan_received(&file_name, 4).await;
        assert_eq!(received, BTreeSet::from([1, 3]));
    }

    #[tokio::test]
    async fn count_parts_ignores_other_filenames() {
        let (_dir, store) = store().await;
        let video = name("video.mp4");
        let other = name("video.mp4.extra");

        store.put_chunk(&video, 0, b"a").await.unwrap();
        store.put_chunk(&other, 0, b"x").await.unwrap();

        assert_eq!(store.count_parts(&video).await, 1);
        assert_eq!(store.count_parts(&other).await, 1);
    }

    #[tokio::test]
    async fn staged_final_publishes_atomically() {
        let (dir, store) = store().await;
        let file_name = name("video.mp4");

        let mut staged = store.stage_final(&file_name).await.unwrap();
        staged.writer().write_all(b"assembled").await.unwrap();
        assert!(!store.final_exists(&file_name).await);

        let path = store.publish_final(staged).await.unwrap();
        assert_eq!(path, dir.path().join("video.mp4"));
        assert_eq!(std::fs::read(path).unwrap(), b"assembled");
    }

    #[tokio::test]
    async fn discarded_final_leaves_nothing_behind() {
        let (dir, store) = store().await;
        let file_name = name("video.mp4");

        let mut staged = store.stage_final(&file_name).await.unwrap();
        staged.writer().write_all(b"partial").await.unwrap();
        store.discard_final(staged).await;

        assert!(!store.final_exists(&file_name).await);
        let leftover = std::fs::read_dir(dir.path().join(PARTS_DIR))
            .unwrap()
            .count();
        assert_eq!(leftover, 0);
    }

    #[tokio::test]
    async fn purge_session_removes_all_parts() {
        let (_dir, store) = store().await;
        let file_name = name("video.mp4");

        for index in 0..3 {
            store.put_chunk(&file_name, index, b"x").await.unwrap();
        }

        let removed = store.purge_session(&file_name, 3).await;
        assert_eq!(removed, 3);
        assert_eq!(store.count_parts(&file_name).await, 0);
    }

    #[tokio::test]
    async fn sweep_removes_only_old_temps() {
        let (dir, store) = store().await;

        let parts = dir.path().join(PARTS_DIR);
        std::fs::write(parts.join("a.0.part.feedface.tmp"), b"stale").unwrap();
        std::fs::write(parts.join("a.0.part"), b"real").unwrap();

        let removed = store.sweep_stale_temps(Duration::ZERO).await;
        assert_eq!(removed, 1);
        assert!(parts.join("a.0.part").exists());

        std::fs::write(parts.join("b.1.part.cafe.tmp"), b"fresh").unwrap();
        let removed = store.sweep_stale_temps(Duration::from_secs(3600)).await;
        assert_eq!(removed, 0);
    }
}
