//! Worker Pool Coordinator
//!
//! Owns the set of spawned worker units and every piece of shared mutable
//! state: busy/idle slots, the waiter queue, and the progress accumulator.
//! All of it is mutated by exactly one task, in response to messages on one
//! serialized channel, so no locks are needed and no two handlers ever run
//! concurrently.
//!
//! Unit lifecycle: registered (warming) -> `ready` -> Idle -> acquired ->
//! Busy -> `exit` -> Idle. Release is an explicit transition handled here
//! when the worker's own completion protocol signals it is free; a parked
//! acquirer, if any, is unblocked as part of the same transition (FIFO).

use std::collections::{HashMap, VecDeque};

use tokio::sync::{mpsc, oneshot};

use crate::error::{PoolError, PoolResult};
use crate::events::{EventBus, PoolEvent};
use crate::protocol::{RunCommand, WorkerMessage};
use crate::types::{ProgressUpdate, WorkerId};

// =============================================================================
// Worker Unit
// =============================================================================

/// Handle to an acquired worker unit.
#[derive(Debug, Clone)]
pub struct WorkerUnit {
    pub id: WorkerId,
    commands: mpsc::Sender<RunCommand>,
}

impl WorkerUnit {
    /// Post a job to the unit.
    pub async fn send(&self, command: RunCommand) -> PoolResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| PoolError::WorkerLost(self.id))
    }
}

// =============================================================================
// Coordinator Messages
// =============================================================================

pub(crate) enum PoolMsg {
    /// Download progressed; `fraction` is bytes_loaded / bytes_total.
    DownloadProgress { fraction: f64 },
    /// A freshly spawned unit, not yet warmed up.
    Register {
        id: WorkerId,
        commands: mpsc::Sender<RunCommand>,
    },
    /// Lifecycle message relayed from one worker.
    FromWorker { id: WorkerId, msg: WorkerMessage },
    /// A worker's message channel closed without a terminal signal.
    WorkerGone { id: WorkerId },
    /// Drop units that never finished warmup (cancelled load).
    AbortWarmup,
    /// Request for an idle unit.
    Acquire { reply: oneshot::Sender<WorkerUnit> },
    /// Tear the pool down.
    Shutdown,
}

// =============================================================================
// Pool Handle
// =============================================================================

/// Cloneable handle to the coordinator task.
#[derive(Clone)]
pub struct PoolHandle {
    tx: mpsc::Sender<PoolMsg>,
}

impl PoolHandle {
    /// Acquire an idle worker unit, waiting for the next free-worker
    /// transition if none is idle. Waiters are served FIFO.
    pub async fn acquire(&self) -> PoolResult<WorkerUnit> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PoolMsg::Acquire { reply: reply_tx })
            .await
            .map_err(|_| PoolError::PoolClosed)?;
        reply_rx.await.map_err(|_| PoolError::PoolClosed)
    }

    /// Tear the pool down. Idempotent; the event bus closes as part of it.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(PoolMsg::Shutdown).await;
    }

    pub(crate) async fn send(&self, msg: PoolMsg) -> PoolResult<()> {
        self.tx.send(msg).await.map_err(|_| PoolError::PoolClosed)
    }
}

// =============================================================================
// Worker Pool
// =============================================================================

/// Spawns the coordinator task for a pool of `threads` units.
pub struct WorkerPool;

impl WorkerPool {
    pub fn start(threads: usize, bus: EventBus) -> PoolHandle {
        let (tx, rx) = mpsc::channel(64);
        let coordinator = Coordinator {
            bus,
            threads,
            units: HashMap::new(),
            idle: VecDeque::new(),
            waiters: VecDeque::new(),
            percent: 0.0,
            ready_workers: 0,
        };
        tokio::spawn(coordinator.run(rx));
        PoolHandle { tx }
    }
}

// =============================================================================
// Coordinator
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerStatus {
    Warming,
    Idle,
    Busy,
}

struct UnitSlot {
    commands: mpsc::Sender<RunCommand>,
    status: WorkerStatus,
}

/// Single-writer aggregate behind [`PoolHandle`].
struct Coordinator {
    bus: EventBus,
    threads: usize,
    units: HashMap<WorkerId, UnitSlot>,
    idle: VecDeque<WorkerId>,
    waiters: VecDeque<oneshot::Sender<WorkerUnit>>,
    percent: f64,
    ready_workers: usize,
}

impl Coordinator {
    async fn run(mut self, mut rx: mpsc::Receiver<PoolMsg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                PoolMsg::DownloadProgress { fraction } => self.on_download_progress(fraction),
                PoolMsg::Register { id, commands } => self.on_register(id, commands),
                PoolMsg::FromWorker { id, msg } => self.on_worker_message(id, msg),
                PoolMsg::WorkerGone { id } => self.on_worker_gone(id),
                PoolMsg::AbortWarmup => self.on_abort_warmup(),
                PoolMsg::Acquire { reply } => self.on_acquire(reply),
                PoolMsg::Shutdown => break,
            }
        }
        self.bus.close();
        tracing::info!("Worker pool coordinator stopped");
    }

    fn on_download_progress(&mut self, fraction: f64) {
        // Download covers the first 90% of the load sequence, reported to
        // two decimal places.
        let percent = (fraction.clamp(0.0, 1.0) * 90.0 * 100.0).round() / 100.0;
        self.bump_progress(percent, false);
    }

    fn on_register(&mut self, id: WorkerId, commands: mpsc::Sender<RunCommand>) {
        debug_assert!(self.units.len() < self.threads);
        self.units.insert(
            id,
            UnitSlot {
                commands,
                status: WorkerStatus::Warming,
            },
        );
    }

    fn on_worker_message(&mut self, id: WorkerId, msg: WorkerMessage) {
        match msg {
            WorkerMessage::Ready => {
                // A unit dropped by a cancelled load may still signal ready;
                // it must neither bump progress nor join the idle set.
                if !self.units.contains_key(&id) {
                    return;
                }
                self.ready_workers += 1;
                let percent = if self.ready_workers >= self.threads {
                    100.0
                } else {
                    // Warmup splits the remaining 10% evenly across units.
                    self.percent + (1.0 / self.threads as f64) * 10.0
                };
                self.make_available(id);
                self.bump_progress(percent, self.ready_workers >= self.threads);
            }
            WorkerMessage::Run => {
                if let Some(slot) = self.units.get_mut(&id) {
                    slot.status = WorkerStatus::Busy;
                }
            }
            WorkerMessage::Stdout { data } => {
                tracing::debug!(worker = %id, "worker stdout: {}", data);
            }
            WorkerMessage::Stderr { data } => {
                tracing::debug!(worker = %id, "worker stderr: {}", data);
            }
            WorkerMessage::Done { outputs } => {
                let _ = self.bus.publish(PoolEvent::JobResult {
                    worker: id,
                    outputs,
                });
            }
            WorkerMessage::Exit => {
                self.make_available(id);
                let _ = self.bus.publish(PoolEvent::WorkerFreed { worker: id });
            }
        }
    }

    /// Return a unit to circulation: hand it to the oldest live waiter, or
    /// park it in the idle queue.
    fn make_available(&mut self, id: WorkerId) {
        let Some(slot) = self.units.get_mut(&id) else {
            return;
        };
        let commands = slot.commands.clone();

        while let Some(reply) = self.waiters.pop_front() {
            if reply.send(WorkerUnit { id, commands: commands.clone() }).is_ok() {
                slot.status = WorkerStatus::Busy;
                return;
            }
            // Acquirer gave up; try the next one.
        }

        slot.status = WorkerStatus::Idle;
        self.idle.push_back(id);
    }

    fn on_worker_gone(&mut self, id: WorkerId) {
        let Some(slot) = self.units.remove(&id) else {
            return;
        };
        self.idle.retain(|idle_id| *idle_id != id);
        if slot.status == WorkerStatus::Busy {
            tracing::error!(worker = %id, "Worker vanished mid-job");
            let _ = self.bus.publish(PoolEvent::WorkerLost { worker: id });
        } else {
            tracing::warn!(worker = %id, "Worker vanished while {:?}", slot.status);
        }
    }

    fn on_abort_warmup(&mut self) {
        // Units that never signaled ready must not become referencable as
        // idle after a cancelled load.
        self.units
            .retain(|_, slot| slot.status != WorkerStatus::Warming);
    }

    fn on_acquire(&mut self, reply: oneshot::Sender<WorkerUnit>) {
        if let Some(id) = self.idle.pop_front() {
            if let Some(slot) = self.units.get_mut(&id) {
                slot.status = WorkerStatus::Busy;
                let _ = reply.send(WorkerUnit {
                    id,
                    commands: slot.commands.clone(),
                });
                return;
            }
        }
        self.waiters.push_back(reply);
    }

    /// Progress never decreases within one load sequence.
    fn bump_progress(&mut self, percent: f64, ready: bool) {
        self.percent = self.percent.max(percent);
        let _ = self.bus.publish(PoolEvent::Progress(ProgressUpdate {
            percent: self.percent,
            ready,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn register_ready_worker(
        handle: &PoolHandle,
        id: u32,
    ) -> mpsc::Receiver<RunCommand> {
        let (commands, command_rx) = mpsc::channel(1);
        handle
            .send(PoolMsg::Register {
                id: WorkerId(id),
                commands,
            })
            .await
            .unwrap();
        handle
            .send(PoolMsg::FromWorker {
                id: WorkerId(id),
                msg: WorkerMessage::Ready,
            })
            .await
            .unwrap();
        command_rx
    }

    #[tokio::test]
    async fn acquire_hands_out_distinct_idle_units() {
        let bus = EventBus::default();
        let handle = WorkerPool::start(2, bus);
        let _rx0 = register_ready_worker(&handle, 0).await;
        let _rx1 = register_ready_worker(&handle, 1).await;

        let first = handle.acquire().await.unwrap();
        let second = handle.acquire().await.unwrap();
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn acquire_blocks_until_a_unit_frees_up() {
        let bus = EventBus::default();
        let handle = WorkerPool::start(1, bus);
        let _rx = register_ready_worker(&handle, 0).await;

        let held = handle.acquire().await.unwrap();
        assert_eq!(held.id, WorkerId(0));

        let waiter = tokio::spawn({
            let handle = handle.clone();
            async move { handle.acquire().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished(), "acquire must park while all busy");

        // Worker signals completion; the parked acquirer gets the unit.
        handle
            .send(PoolMsg::FromWorker {
                id: WorkerId(0),
                msg: WorkerMessage::Exit,
            })
            .await
            .unwrap();

        let unit = waiter.await.unwrap().unwrap();
        assert_eq!(unit.id, WorkerId(0));
    }

    #[tokio::test]
    async fn exit_without_waiters_publishes_worker_freed() {
        let bus = EventBus::default();
        let mut events = bus.subscribe();
        let handle = WorkerPool::start(1, bus);
        let _rx = register_ready_worker(&handle, 0).await;

        let _unit = handle.acquire().await.unwrap();
        handle
            .send(PoolMsg::FromWorker {
                id: WorkerId(0),
                msg: WorkerMessage::Exit,
            })
            .await
            .unwrap();

        loop {
            match events.recv().await.unwrap() {
                PoolEvent::WorkerFreed { worker } => {
                    assert_eq!(worker, WorkerId(0));
                    break;
                }
                _ => continue,
            }
        }

        // The freed unit is idle again and immediately acquirable.
        let unit = handle.acquire().await.unwrap();
        assert_eq!(unit.id, WorkerId(0));
    }

    #[tokio::test]
    async fn progress_is_monotone_within_one_load() {
        let bus = EventBus::default();
        let mut progress = bus.progress_updates();
        let handle = WorkerPool::start(2, bus);

        handle
            .send(PoolMsg::DownloadProgress { fraction: 0.5 })
            .await
            .unwrap();
        handle
            .send(PoolMsg::DownloadProgress { fraction: 0.25 })
            .await
            .unwrap();

        assert_eq!(progress.recv().await.unwrap().percent, 45.0);
        // A stale lower fraction must not move the accumulator backwards.
        assert_eq!(progress.recv().await.unwrap().percent, 45.0);
    }

    #[tokio::test]
    async fn warmup_completes_at_exactly_one_hundred() {
        let bus = EventBus::default();
        let mut progress = bus.progress_updates();
        let handle = WorkerPool::start(2, bus);

        handle
            .send(PoolMsg::DownloadProgress { fraction: 1.0 })
            .await
            .unwrap();
        let _rx0 = register_ready_worker(&handle, 0).await;
        let _rx1 = register_ready_worker(&handle, 1).await;

        assert_eq!(
            progress.recv().await.unwrap(),
            ProgressUpdate {
                percent: 90.0,
                ready: false
            }
        );
        assert_eq!(
            progress.recv().await.unwrap(),
            ProgressUpdate {
                percent: 95.0,
                ready: false
            }
        );
        assert_eq!(
            progress.recv().await.unwrap(),
            ProgressUpdate {
                percent: 100.0,
                ready: true
            }
        );
    }

    #[tokio::test]
    async fn busy_worker_vanishing_is_surfaced_as_worker_lost() {
        let bus = EventBus::default();
        let mut events = bus.subscribe();
        let handle = WorkerPool::start(1, bus);
        let _rx = register_ready_worker(&handle, 0).await;

        let _unit = handle.acquire().await.unwrap();
        handle
            .send(PoolMsg::WorkerGone { id: WorkerId(0) })
            .await
            .unwrap();

        loop {
            match events.recv().await.unwrap() {
                PoolEvent::WorkerLost { worker } => {
                    assert_eq!(worker, WorkerId(0));
                    break;
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn aborted_warmup_drops_units_that_never_became_ready() {
        let bus = EventBus::default();
        let handle = WorkerPool::start(2, bus);

        let (commands, _command_rx) = mpsc::channel(1);
        handle
            .send(PoolMsg::Register {
                id: WorkerId(0),
                commands,
            })
            .await
            .unwrap();
        handle.send(PoolMsg::AbortWarmup).await.unwrap();

        // A late ready signal from the dropped unit must not make it idle.
        handle
            .send(PoolMsg::FromWorker {
                id: WorkerId(0),
                msg: WorkerMessage::Ready,
            })
            .await
            .unwrap();

        let waiter = tokio::spawn({
            let handle = handle.clone();
            async move { handle.acquire().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        waiter.abort();
    }

    #[tokio::test]
    async fn shutdown_closes_the_event_bus() {
        let bus = EventBus::default();
        let mut events = bus.subscribe();
        let handle = WorkerPool::start(1, bus);

        handle.shutdown().await;
        assert_eq!(events.recv().await, None);
        assert!(matches!(
            handle.acquire().await,
            Err(PoolError::PoolClosed)
        ));
    }
}
