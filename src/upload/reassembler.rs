//! Ordered chunk reassembly
//!
//! Concatenates chunk artifacts in ascending index order into a staged
//! output file, then publishes it atomically. Chunks are only deleted after
//! the final artifact is visible, so a failed merge is always retryable.

use std::path::PathBuf;

use crate::sanitize::SafeFileName;
use crate::upload::chunk_store::ChunkStore;
use crate::upload::types::UploadError;

/// Merges a session's chunk artifacts into the final file.
#[derive(Clone)]
pub struct Reassembler {
    store: ChunkStore,
}

impl Reassembler {
    pub fn new(store: ChunkStore) -> Self {
        Self { store }
    }

    /// Reassemble chunks `0..total` into the final artifact.
    ///
    /// On any open or copy failure the staged output is discarded and every
    /// chunk artifact is left in place; the caller surfaces the error and a
    /// later retry starts from intact state. On success the final artifact is
    /// published first and the consumed chunks are deleted afterwards, with
    /// deletion failures logged and tolerated.
    pub async fn merge(&self, name: &SafeFileName, total: u64) -> Result<PathBuf, UploadError> {
        tracing::info!(file_name = %name, total_chunks = total, "starting merge");

        let mut staged = self.store.stage_final(name).await?;
        let mut bytes_written = 0u64;

        for index in 0..total {
            let mut chunk = match self.store.open_chunk(name, index).await {
                Ok(chunk) => chunk,
                Err(err) => {
                    self.store.discard_final(staged).await;
                    return Err(err);
                }
            };

            match tokio::io::copy(&mut chunk, staged.writer()).await {
                Ok(copied) => bytes_written += copied,
                Err(err) => {
                    self.store.discard_final(staged).await;
                    return Err(UploadError::Storage(err));
                }
            }
        }

        let final_path = self.store.publish_final(staged).await?;

        for index in 0..total {
            if let Err(err) = self.store.delete_chunk(name, index).await {
                tracing::warn!(
                    file_name = %name,
                    chunk_index = index,
                    error = %err,
                    "failed to delete merged chunk"
                );
            }
        }

        tracing::info!(
            file_name = %name,
            total_chunks = total,
            bytes = bytes_written,
            path = %final_path.display(),
            "merge complete"
        );

        Ok(final_path)
    }
}
