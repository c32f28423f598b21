//! Worker Engine Seam
//!
//! The transcoding executable is opaque; all the orchestrator needs is a way
//! to spawn independent worker instances of it and exchange protocol
//! messages with each one. [`WorkerEngine`] is that seam, so the pool can be
//! exercised in unit tests without any real executable.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::PoolResult;
use crate::protocol::{RunCommand, WorkerMessage};

/// Channel pair connecting the coordinator to one spawned worker.
///
/// Commands flow in, lifecycle messages flow out. The message channel
/// closing without a terminal [`WorkerMessage::Exit`] means the worker
/// crashed or hung; the pool surfaces that to the pending submission.
pub struct WorkerChannels {
    pub commands: mpsc::Sender<RunCommand>,
    pub messages: mpsc::Receiver<WorkerMessage>,
}

/// Spawns worker instances from a downloaded executable payload.
#[async_trait]
pub trait WorkerEngine: Send + Sync + 'static {
    /// Spawn one worker. Called once per configured thread during warmup;
    /// each instance must eventually emit [`WorkerMessage::Ready`].
    async fn spawn_worker(&self, payload: &[u8]) -> PoolResult<WorkerChannels>;
}
