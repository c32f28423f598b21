//! Transcode Session Facade
//!
//! One session owns one event bus, one worker pool, and the loader and
//! dispatcher wired to them. Sessions are independent of each other; there
//! is no ambient global state, so a host can run several side by side.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::chunk::DEFAULT_CHUNK_SIZE;
use crate::dispatch::{ByteSource, Dispatcher, Job};
use crate::engine::WorkerEngine;
use crate::error::{PoolError, PoolResult};
use crate::events::{EventBus, ProgressStream, ResultStream, Subscription};
use crate::loader::Loader;
use crate::pool::{PoolHandle, WorkerPool};
use crate::types::ResultMap;

// =============================================================================
// Configuration
// =============================================================================

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Number of worker units spawned during warmup. Fixed for the life of
    /// the session.
    pub threads: usize,
    /// Chunk size for input reads.
    pub chunk_size: usize,
    /// Cap on simultaneously active batch submissions, independent of pool
    /// size.
    pub batch_concurrency: usize,
    /// Optional per-job deadline. `None` reproduces the original behavior:
    /// a worker that never signals completion holds its slot forever.
    pub job_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            chunk_size: DEFAULT_CHUNK_SIZE,
            batch_concurrency: 4,
            job_timeout: None,
        }
    }
}

// =============================================================================
// Session
// =============================================================================

pub struct TranscodeSession<E: WorkerEngine> {
    config: SessionConfig,
    bus: EventBus,
    pool: PoolHandle,
    loader: Loader<E>,
    dispatcher: Dispatcher,
    loaded: AtomicBool,
    load_cancel: Mutex<CancellationToken>,
}

impl<E: WorkerEngine> TranscodeSession<E> {
    pub fn new(engine: E, config: SessionConfig) -> Self {
        let bus = EventBus::default();
        let pool = WorkerPool::start(config.threads, bus.clone());
        let loader = Loader::new(
            Arc::new(engine),
            config.threads,
            bus.clone(),
            pool.clone(),
        );
        let dispatcher = Dispatcher::new(
            pool.clone(),
            bus.clone(),
            config.batch_concurrency,
            config.job_timeout,
        );

        Self {
            config,
            bus,
            pool,
            loader,
            dispatcher,
            loaded: AtomicBool::new(false),
            load_cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Stream of aggregate load progress.
    pub fn progress(&self) -> ProgressStream {
        self.bus.progress_updates()
    }

    /// Stream of decoded result fragments, for consumers that accumulate
    /// state additively instead of awaiting individual submissions.
    pub fn results(&self) -> ResultStream {
        self.bus.results()
    }

    /// Raw event subscription.
    pub fn events(&self) -> Subscription {
        self.bus.subscribe()
    }

    /// Download the executable payload and warm up the pool. Returns once
    /// every worker has signaled readiness.
    pub async fn load(&self, url: &str) -> PoolResult<()> {
        // Each attempt gets a fresh token, so a cancelled load leaves
        // later attempts usable.
        let cancel = CancellationToken::new();
        *self.current_load_cancel() = cancel.clone();
        self.loader.load(url, &cancel).await?;
        self.loaded.store(true, Ordering::Release);
        Ok(())
    }

    /// Abort the in-flight load, if any. The download transport is dropped
    /// and half-warmed workers never join the idle set.
    pub fn cancel_load(&self) {
        self.current_load_cancel().cancel();
    }

    fn current_load_cancel(&self) -> MutexGuard<'_, CancellationToken> {
        self.load_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Submit an arbitrary job.
    pub async fn submit(&self, job: Job) -> PoolResult<ResultMap> {
        self.ensure_ready()?;
        self.dispatcher.submit(job).await
    }

    /// Extract one frame from a single input source.
    pub async fn clip_frame(
        &self,
        source: &ByteSource,
        frame: u64,
        cancel: &CancellationToken,
    ) -> PoolResult<ResultMap> {
        self.ensure_ready()?;
        let name = source.name();
        let bytes = source.read(self.config.chunk_size, cancel).await?;
        self.dispatcher.submit(Job::clip_frame(&name, bytes, frame)).await
    }

    /// Extract one frame from each source, bounded by the configured batch
    /// concurrency. Per-source failures leave the other entries intact.
    pub async fn clip_frames(
        &self,
        sources: Vec<ByteSource>,
        frame: u64,
        cancel: &CancellationToken,
    ) -> PoolResult<Vec<PoolResult<ResultMap>>> {
        self.ensure_ready()?;
        Ok(self
            .dispatcher
            .submit_each(sources, self.config.chunk_size, cancel, |name, bytes| {
                Job::clip_frame(&name, bytes, frame)
            })
            .await)
    }

    /// Tear the session down. The event bus closes; in-flight submissions
    /// fail rather than hang.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }

    fn ensure_ready(&self) -> PoolResult<()> {
        if self.loaded.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(PoolError::PoolNotReady)
        }
    }
}
