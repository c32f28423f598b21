//! Transpool Error Definitions
//!
//! Defines error types used throughout the crate.

use std::time::Duration;

use thiserror::Error;

use crate::types::WorkerId;

/// Orchestration error types
#[derive(Error, Debug)]
pub enum PoolError {
    // =========================================================================
    // Transport Errors
    // =========================================================================
    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Load cancelled")]
    LoadCancelled,

    // =========================================================================
    // Input Errors
    // =========================================================================
    #[error("Chunk read failed: {0}")]
    ChunkRead(#[from] std::io::Error),

    #[error("Read cancelled")]
    ReadCancelled,

    // =========================================================================
    // Pool Lifecycle Errors
    // =========================================================================
    #[error("Worker pool is not ready; call load() first")]
    PoolNotReady,

    #[error("Worker pool has shut down")]
    PoolClosed,

    #[error("Event bus is closed")]
    BusClosed,

    // =========================================================================
    // Job Errors
    // =========================================================================
    #[error("Worker {0} exited without reporting a result")]
    WorkerLost(WorkerId),

    #[error("Job timed out after {0:?}")]
    JobTimeout(Duration),

    #[error("Worker command encoding failed: {0}")]
    Codec(#[from] serde_json::Error),

    // =========================================================================
    // Engine Errors
    // =========================================================================
    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),
}

/// Result type alias for pool operations
pub type PoolResult<T> = Result<T, PoolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_are_descriptive() {
        let err = PoolError::DownloadFailed("status 503".to_string());
        assert_eq!(err.to_string(), "Download failed: status 503");

        let err = PoolError::WorkerLost(WorkerId(2));
        assert!(err.to_string().contains("Worker 2"));
    }

    #[test]
    fn io_errors_convert_to_chunk_read() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read");
        let err: PoolError = io.into();
        assert!(matches!(err, PoolError::ChunkRead(_)));
    }
}
