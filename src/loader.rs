//! Executable Payload Loader
//!
//! Two-phase load sequence. Phase 1 streams the transcoding executable over
//! HTTP, reporting byte-level progress mapped onto 0-90%. Phase 2 spawns the
//! configured number of worker units from the payload and waits for each to
//! signal readiness; every `ready` covers an even share of the final 10%.
//!
//! Cancellation aborts the in-flight transport (the response is dropped,
//! closing the connection) and instructs the pool to drop any units that
//! never finished warmup.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::engine::WorkerEngine;
use crate::error::{PoolError, PoolResult};
use crate::events::{EventBus, PoolEvent};
use crate::pool::{PoolHandle, PoolMsg};
use crate::types::WorkerId;

pub struct Loader<E: WorkerEngine> {
    engine: Arc<E>,
    threads: usize,
    bus: EventBus,
    pool: PoolHandle,
}

impl<E: WorkerEngine> Loader<E> {
    pub fn new(engine: Arc<E>, threads: usize, bus: EventBus, pool: PoolHandle) -> Self {
        Self {
            engine,
            threads,
            bus,
            pool,
        }
    }

    /// Run the full load sequence. Progress is published on the event bus;
    /// the call returns once the pool is ready, the transport fails, or
    /// `cancel` fires.
    pub async fn load(&self, url: &str, cancel: &CancellationToken) -> PoolResult<()> {
        match self.load_inner(url, cancel).await {
            Ok(()) => Ok(()),
            Err(err) => {
                if matches!(err, PoolError::LoadCancelled) {
                    let _ = self.pool.send(PoolMsg::AbortWarmup).await;
                } else {
                    let _ = self.bus.publish(PoolEvent::LoadFailed {
                        message: err.to_string(),
                    });
                }
                Err(err)
            }
        }
    }

    async fn load_inner(&self, url: &str, cancel: &CancellationToken) -> PoolResult<()> {
        let payload = self.download(url, cancel).await?;
        tracing::info!("Downloaded executable payload: {} bytes", payload.len());
        self.warm_up(&payload, cancel).await
    }

    /// Phase 1: streaming fetch with byte-level progress.
    async fn download(&self, url: &str, cancel: &CancellationToken) -> PoolResult<Vec<u8>> {
        let client = reqwest::Client::new();
        let mut response = client.get(url).send().await?.error_for_status()?;

        let total = response.content_length().unwrap_or(0);
        let mut payload: Vec<u8> = Vec::with_capacity(total as usize);

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Load cancelled mid-download");
                    return Err(PoolError::LoadCancelled);
                }
                chunk = response.chunk() => chunk?,
            };
            match chunk {
                Some(bytes) => {
                    payload.extend_from_slice(&bytes);
                    if total > 0 {
                        let fraction = payload.len() as f64 / total as f64;
                        self.pool
                            .send(PoolMsg::DownloadProgress { fraction })
                            .await?;
                    }
                }
                None => break,
            }
        }

        if payload.is_empty() {
            return Err(PoolError::DownloadFailed(format!(
                "empty payload from {url}"
            )));
        }

        // Servers without a content length never reported intermediate
        // progress; land on 90 before warmup either way.
        self.pool
            .send(PoolMsg::DownloadProgress { fraction: 1.0 })
            .await?;
        Ok(payload)
    }

    /// Phase 2: spawn units and wait for every readiness signal.
    async fn warm_up(&self, payload: &[u8], cancel: &CancellationToken) -> PoolResult<()> {
        // Subscribe before spawning so no ready transition is missed.
        let mut events = self.bus.subscribe();

        for index in 0..self.threads {
            let id = WorkerId(index as u32);
            let channels = self.engine.spawn_worker(payload).await?;

            self.pool
                .send(PoolMsg::Register {
                    id,
                    commands: channels.commands,
                })
                .await?;

            // Relay this unit's messages into the coordinator's serialized
            // channel. Channel closure without `exit` is a crash signal.
            let pool = self.pool.clone();
            let mut messages = channels.messages;
            tokio::spawn(async move {
                while let Some(msg) = messages.recv().await {
                    if pool.send(PoolMsg::FromWorker { id, msg }).await.is_err() {
                        return;
                    }
                }
                let _ = pool.send(PoolMsg::WorkerGone { id }).await;
            });
        }

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Load cancelled during warmup");
                    return Err(PoolError::LoadCancelled);
                }
                event = events.recv() => event,
            };
            match event {
                Some(PoolEvent::Progress(update)) if update.ready => return Ok(()),
                Some(_) => continue,
                None => return Err(PoolError::PoolClosed),
            }
        }
    }
}
