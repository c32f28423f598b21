//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! One multiplexed channel carries every pool notification as a tagged
//! [`PoolEvent`]. Delivery is broadcast: every subscriber active at publish
//! time receives every event, in publish order. Subscribers that attach later
//! do not see earlier events. The bus has a terminal closed state; publishing
//! after close is an error and subscribers observe end-of-stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::error::{PoolError, PoolResult};
use crate::protocol::OutputArtifact;
use crate::types::{ProgressUpdate, ResultMap, WorkerId};

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 256;

// =============================================================================
// Events
// =============================================================================

/// Notification published on the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum PoolEvent {
    /// Aggregate load progress changed.
    Progress(ProgressUpdate),
    /// A worker unit returned to the idle set.
    WorkerFreed { worker: WorkerId },
    /// A worker unit completed a job.
    JobResult {
        worker: WorkerId,
        outputs: Vec<OutputArtifact>,
    },
    /// A worker unit vanished mid-job without a terminal signal.
    WorkerLost { worker: WorkerId },
    /// The load sequence failed before the pool became ready.
    LoadFailed { message: String },
    /// Terminal marker; no further events follow.
    Closed,
}

// =============================================================================
// Event Bus
// =============================================================================

/// In-process fan-out event bus for pool notifications.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PoolEvent>,
    closed: Arc<AtomicBool>,
}

impl EventBus {
    /// Create a bus with a specific channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Publish an event to all current subscribers.
    ///
    /// Having zero subscribers is not an error; the event is simply dropped.
    pub fn publish(&self, event: PoolEvent) -> PoolResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::BusClosed);
        }
        let _ = self.sender.send(event);
        Ok(())
    }

    /// Close the bus. Subscribers receive a terminal [`PoolEvent::Closed`]
    /// and further publishes fail.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.sender.send(PoolEvent::Closed);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Subscribe to all events published from this point on.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            done: self.closed.load(Ordering::Acquire),
        }
    }

    /// Subscribe to progress updates only.
    pub fn progress_updates(&self) -> ProgressStream {
        ProgressStream {
            inner: self.subscribe(),
        }
    }

    /// Subscribe to decoded job results only.
    pub fn results(&self) -> ResultStream {
        ResultStream {
            inner: self.subscribe(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// =============================================================================
// Subscriptions
// =============================================================================

/// One subscriber's view of the bus.
///
/// `recv` yields `None` once the bus closes. A subscriber that falls behind
/// the channel capacity skips the overwritten events and keeps receiving.
pub struct Subscription {
    receiver: broadcast::Receiver<PoolEvent>,
    done: bool,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<PoolEvent> {
        if self.done {
            return None;
        }
        loop {
            match self.receiver.recv().await {
                Ok(PoolEvent::Closed) | Err(broadcast::error::RecvError::Closed) => {
                    self.done = true;
                    return None;
                }
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Event subscriber lagged; skipped {} events", skipped);
                }
            }
        }
    }
}

/// Subscription filtered to [`PoolEvent::Progress`].
pub struct ProgressStream {
    inner: Subscription,
}

impl ProgressStream {
    pub async fn recv(&mut self) -> Option<ProgressUpdate> {
        while let Some(event) = self.inner.recv().await {
            if let PoolEvent::Progress(update) = event {
                return Some(update);
            }
        }
        None
    }
}

/// Subscription filtered to [`PoolEvent::JobResult`], decoded into
/// `(worker, fragment)` pairs for additive merging by the consumer.
pub struct ResultStream {
    inner: Subscription,
}

impl ResultStream {
    pub async fn recv(&mut self) -> Option<(WorkerId, ResultMap)> {
        while let Some(event) = self.inner.recv().await {
            if let PoolEvent::JobResult { worker, outputs } = event {
                return Some((worker, ResultMap::from_artifacts(&outputs)));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_reaches_every_active_subscriber() {
        let bus = EventBus::default();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.publish(PoolEvent::WorkerFreed {
            worker: WorkerId(0),
        })
        .unwrap();

        assert_eq!(
            first.recv().await,
            Some(PoolEvent::WorkerFreed {
                worker: WorkerId(0)
            })
        );
        assert_eq!(
            second.recv().await,
            Some(PoolEvent::WorkerFreed {
                worker: WorkerId(0)
            })
        );
    }

    #[tokio::test]
    async fn late_subscriber_misses_earlier_events() {
        let bus = EventBus::default();
        bus.publish(PoolEvent::WorkerFreed {
            worker: WorkerId(0),
        })
        .unwrap();

        let mut late = bus.subscribe();
        bus.publish(PoolEvent::WorkerFreed {
            worker: WorkerId(1),
        })
        .unwrap();

        assert_eq!(
            late.recv().await,
            Some(PoolEvent::WorkerFreed {
                worker: WorkerId(1)
            })
        );
    }

    #[tokio::test]
    async fn publish_after_close_is_an_error() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe();

        bus.close();
        assert!(matches!(
            bus.publish(PoolEvent::WorkerFreed {
                worker: WorkerId(0)
            }),
            Err(PoolError::BusClosed)
        ));
        assert_eq!(sub.recv().await, None);
        // Terminal: stays None
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn progress_stream_filters_other_event_kinds() {
        let bus = EventBus::default();
        let mut progress = bus.progress_updates();

        bus.publish(PoolEvent::WorkerFreed {
            worker: WorkerId(3),
        })
        .unwrap();
        bus.publish(PoolEvent::Progress(ProgressUpdate {
            percent: 45.0,
            ready: false,
        }))
        .unwrap();

        let update = progress.recv().await.unwrap();
        assert_eq!(update.percent, 45.0);
        assert!(!update.ready);
    }
}
