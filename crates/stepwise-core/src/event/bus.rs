//! Broadcast event bus for live run progress.
//!
//! Every event the engine persists is also published here. Publishing with no
//! active subscribers is a no-op; the persisted log stays authoritative.

use stepwise_types::event::WorkflowEvent;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Multi-consumer bus of workflow lifecycle events.
///
/// Cloning the bus clones the sender, allowing multiple producers and consumers.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Create a new subscriber that will receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }

    /// Subscribe to the events of a single run.
    pub fn subscribe_run(&self, run_id: Uuid) -> RunSubscription {
        RunSubscription {
            run_id,
            receiver: self.sender.subscribe(),
        }
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: WorkflowEvent) {
        let _ = self.sender.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

/// A receiver filtered to one run id.
pub struct RunSubscription {
    run_id: Uuid,
    receiver: broadcast::Receiver<WorkflowEvent>,
}

impl RunSubscription {
    /// Next event for this run, or `None` once the bus is closed.
    ///
    /// Lagged gaps are skipped; the persisted log has the full history.
    pub async fn recv(&mut self) -> Option<WorkflowEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.run_id == self.run_id => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(run_id = %self.run_id, skipped, "event subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
