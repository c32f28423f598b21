//! Command Dispatcher
//!
//! Turns a job (command + input buffers) into a decoded result fragment:
//! acquire a worker unit, post the command, await the completion event
//! correlated to that unit's identity, decode the output artifacts. The
//! unit's own `exit` signal returns it to the idle set (handled by the pool
//! coordinator), so release needs no action here.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::chunk::{read_file_in_chunks, read_in_chunks};
use crate::error::{PoolError, PoolResult};
use crate::events::{EventBus, PoolEvent};
use crate::pool::PoolHandle;
use crate::protocol::{InputBuffer, RunCommand};
use crate::types::ResultMap;

// =============================================================================
// Jobs
// =============================================================================

/// One transcode request: ordered arguments plus named input buffers.
#[derive(Debug, Clone)]
pub struct Job {
    pub arguments: Vec<String>,
    pub inputs: Vec<InputBuffer>,
}

impl Job {
    /// Extract a single frame from a video buffer as `<name>.jpg`.
    pub fn clip_frame(name: &str, bytes: Vec<u8>, frame: u64) -> Self {
        Self {
            arguments: vec![
                "-i".to_string(),
                name.to_string(),
                "-vf".to_string(),
                format!("trim=start_frame={}:end_frame={}", frame, frame + 1),
                "-an".to_string(),
                format!("{name}.jpg"),
            ],
            inputs: vec![InputBuffer {
                name: name.to_string(),
                bytes,
            }],
        }
    }
}

// =============================================================================
// Input Sources
// =============================================================================

/// A job input: a file on disk or an in-memory buffer. Both are funneled
/// through the chunked reader so peak memory stays bounded per read.
#[derive(Debug, Clone)]
pub enum ByteSource {
    File(PathBuf),
    Memory { name: String, bytes: Vec<u8> },
}

impl ByteSource {
    /// Filename the worker sees for this input.
    pub fn name(&self) -> String {
        match self {
            ByteSource::File(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "input".to_string()),
            ByteSource::Memory { name, .. } => name.clone(),
        }
    }

    pub async fn read(
        &self,
        chunk_size: usize,
        cancel: &CancellationToken,
    ) -> PoolResult<Vec<u8>> {
        match self {
            ByteSource::File(path) => read_file_in_chunks(path, chunk_size, cancel).await,
            ByteSource::Memory { bytes, .. } => {
                read_in_chunks(std::io::Cursor::new(bytes), bytes.len(), chunk_size, cancel).await
            }
        }
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

pub struct Dispatcher {
    pool: PoolHandle,
    bus: EventBus,
    batch_concurrency: usize,
    job_timeout: Option<Duration>,
}

impl Dispatcher {
    pub fn new(
        pool: PoolHandle,
        bus: EventBus,
        batch_concurrency: usize,
        job_timeout: Option<Duration>,
    ) -> Self {
        Self {
            pool,
            bus,
            batch_concurrency,
            job_timeout,
        }
    }

    /// Submit one job and await its decoded result fragment.
    ///
    /// Suspends while all units are busy. A unit never receives a second
    /// job before this call has observed its prior completion event.
    pub async fn submit(&self, job: Job) -> PoolResult<ResultMap> {
        let unit = self.pool.acquire().await?;
        // Subscribe after acquiring (the prior job's result for this unit is
        // always published before the unit is released, so it cannot be
        // mistaken for ours) but before posting, so our completion event
        // cannot slip by.
        let mut events = self.bus.subscribe();
        tracing::debug!(worker = %unit.id, "Dispatching job: {:?}", job.arguments);

        unit.send(RunCommand::run(job.arguments, job.inputs)).await?;

        let wait = async {
            while let Some(event) = events.recv().await {
                match event {
                    PoolEvent::JobResult { worker, outputs } if worker == unit.id => {
                        return Ok(outputs);
                    }
                    PoolEvent::WorkerLost { worker } if worker == unit.id => {
                        return Err(PoolError::WorkerLost(worker));
                    }
                    _ => {}
                }
            }
            Err(PoolError::BusClosed)
        };

        let outputs = match self.job_timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| PoolError::JobTimeout(limit))??,
            None => wait.await?,
        };

        Ok(ResultMap::from_artifacts(&outputs))
    }

    /// Submit one job per source, at most `batch_concurrency` in flight at a
    /// time, regardless of pool size. Per-source failures do not abort the
    /// rest of the batch; results come back in source order.
    pub async fn submit_each<F>(
        &self,
        sources: Vec<ByteSource>,
        chunk_size: usize,
        cancel: &CancellationToken,
        build_job: F,
    ) -> Vec<PoolResult<ResultMap>>
    where
        F: Fn(String, Vec<u8>) -> Job,
    {
        let limiter = Arc::new(Semaphore::new(self.batch_concurrency));
        let build_job = &build_job;
        let mut ordered = Vec::with_capacity(sources.len());

        // Read + submit per source under the concurrency cap. The semaphore
        // is never closed, so acquire only fails if the limiter is dropped.
        let tasks: Vec<_> = sources
            .iter()
            .map(|source| {
                let limiter = Arc::clone(&limiter);
                async move {
                    let _permit = limiter
                        .acquire()
                        .await
                        .map_err(|_| PoolError::PoolClosed)?;
                    let name = source.name();
                    let bytes = source.read(chunk_size, cancel).await?;
                    self.submit(build_job(name, bytes)).await
                }
            })
            .collect();

        for result in futures::future::join_all(tasks).await {
            if let Err(err) = &result {
                tracing::warn!("Batch entry failed: {err}");
            }
            ordered.push(result);
        }
        ordered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_frame_builds_the_expected_command() {
        let job = Job::clip_frame("movie.mp4", vec![1, 2, 3], 24);
        assert_eq!(
            job.arguments,
            vec![
                "-i",
                "movie.mp4",
                "-vf",
                "trim=start_frame=24:end_frame=25",
                "-an",
                "movie.mp4.jpg",
            ]
        );
        assert_eq!(job.inputs.len(), 1);
        assert_eq!(job.inputs[0].name, "movie.mp4");
        assert_eq!(job.inputs[0].bytes, vec![1, 2, 3]);
    }

    #[test]
    fn byte_source_names_follow_the_file_name() {
        let source = ByteSource::File(PathBuf::from("/videos/take1.mov"));
        assert_eq!(source.name(), "take1.mov");

        let source = ByteSource::Memory {
            name: "clip.mp4".to_string(),
            bytes: vec![],
        };
        assert_eq!(source.name(), "clip.mp4");
    }

    #[tokio::test]
    async fn memory_sources_read_through_the_chunked_reader() {
        let cancel = CancellationToken::new();
        let bytes: Vec<u8> = (0..2048u32).map(|i| (i % 256) as u8).collect();
        let source = ByteSource::Memory {
            name: "clip.mp4".to_string(),
            bytes: bytes.clone(),
        };
        assert_eq!(source.read(100, &cancel).await.unwrap(), bytes);
    }
}
