//! Chunked Input Reader
//!
//! Streams an arbitrarily large input source into one contiguous buffer
//! using bounded-size sequential reads. Chunks are read strictly in order,
//! never concurrently, so peak memory beyond the destination buffer is one
//! in-flight chunk and byte ordering is preserved by construction.
//!
//! Every exit path (success, read error, cancellation) drops the source,
//! releasing the underlying handle.

use std::path::Path;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

use crate::error::{PoolError, PoolResult};

/// Default chunk size: 10 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 10 * 1024 * 1024;

/// Read exactly `total` bytes from `source` in `chunk_size` slices.
///
/// The destination buffer is pre-allocated and filled by offset, so the
/// assembled bytes match the source regardless of how `total` divides by
/// `chunk_size`. A zero-length source yields an empty buffer with no reads.
pub async fn read_in_chunks<R>(
    mut source: R,
    total: usize,
    chunk_size: usize,
    cancel: &CancellationToken,
) -> PoolResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    if total == 0 {
        return Ok(Vec::new());
    }
    if chunk_size == 0 {
        return Err(PoolError::ChunkRead(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "chunk size must be nonzero",
        )));
    }

    let mut buffer = vec![0u8; total];
    let chunks = total.div_ceil(chunk_size);

    for index in 0..chunks {
        let start = index * chunk_size;
        let end = usize::min(start + chunk_size, total);

        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("Chunked read cancelled at chunk {}/{}", index, chunks);
                return Err(PoolError::ReadCancelled);
            }
            read = source.read_exact(&mut buffer[start..end]) => {
                read?;
            }
        }
    }

    Ok(buffer)
}

/// Read a file from disk through the chunked reader.
pub async fn read_file_in_chunks(
    path: &Path,
    chunk_size: usize,
    cancel: &CancellationToken,
) -> PoolResult<Vec<u8>> {
    let file = tokio::fs::File::open(path).await?;
    let total = file.metadata().await?.len() as usize;
    read_in_chunks(file, total, chunk_size, cancel).await
}
