//! Chunked upload: splits a forward-only byte stream into bounded objects.

use std::num::NonZeroUsize;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use super::chunk_key;
use crate::store::ObjectStore;
use crate::utils::errors::{BackupError, Result};

/// What one finished upload moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadSummary {
    pub chunks: u64,
    pub bytes: u64,
}

/// Upload `reader` to `{group}/{0,1,2,...}` in `chunk_size`-byte chunks.
///
/// The stream is consumed in a single forward pass and only one chunk is
/// ever held in memory, so the stream itself may be arbitrarily large.
/// Every chunk is exactly `chunk_size` bytes except the last; an empty
/// stream still produces one empty chunk so the group exists and
/// reassembles to the empty stream. Chunks go out strictly in index order,
/// and the first failed put fails the whole upload. Chunks uploaded before
/// a failure keep their deterministic keys, so a retried run simply
/// overwrites them.
pub async fn upload_chunked<R>(
    store: &dyn ObjectStore,
    reader: &mut R,
    group: &str,
    chunk_size: NonZeroUsize,
    storage_class: Option<&str>,
) -> Result<UploadSummary>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let chunk_size = chunk_size.get();
    let mut summary = UploadSummary { chunks: 0, bytes: 0 };
    loop {
        let mut chunk = vec![0u8; chunk_size];
        let mut filled = 0;
        while filled < chunk_size {
            let n = reader
                .read(&mut chunk[filled..])
                .await
                .map_err(|source| BackupError::StreamRead {
                    group: group.to_string(),
                    source,
                })?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 && summary.chunks > 0 {
            // The stream ended exactly on a chunk boundary.
            break;
        }
        chunk.truncate(filled);
        let key = chunk_key(group, summary.chunks);
        store
            .put(&key, Bytes::from(chunk), storage_class)
            .await
            .map_err(|source| BackupError::ChunkUpload {
                key: key.clone(),
                source,
            })?;
        debug!(key = %key, size = filled, "uploaded chunk");
        summary.chunks += 1;
        summary.bytes += filled as u64;
        if filled < chunk_size {
            break;
        }
    }
    Ok(summary)
}
