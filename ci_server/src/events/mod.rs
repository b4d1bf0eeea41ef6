//! Queue events for the CI server.
//!
//! Every state change the dispatcher drives is published on a broadcast bus.
//! The event log task turns them into structured log lines; other
//! subscribers may come and go without affecting the queue.

pub mod queue;

pub use queue::QueueEvent;

use tokio::sync::broadcast;

/// Fan-out channel for [`QueueEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<QueueEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event. Events published with no subscriber are dropped.
    pub fn publish(&self, event: QueueEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }
}

/// Log every event until the bus is closed. Spawned as a background tokio task.
pub async fn log_events(mut events: broadcast::Receiver<QueueEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => tracing::info!(kind = event.kind(), event = %json, "Queue event"),
                Err(e) => tracing::error!("Failed to serialize queue event: {e}"),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Queue event log fell behind");
                crate::metrics::error_recorded("event_lag");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    tracing::debug!("Queue event log stopped");
}
