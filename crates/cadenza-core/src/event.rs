//! Broadcast event bus for the live lifecycle event stream.
//!
//! Built on `tokio::sync::broadcast`, the `EventBus` supports multiple
//! concurrent subscribers. Publishing with no active subscribers is a no-op.
//! The bus is the push-style complement to polling `get_workflow_status`;
//! the same events are also persisted through the store for auditability.

use std::collections::HashMap;

use cadenza_types::workflow::WorkflowEvent;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::store::WorkflowStore;

/// Multi-consumer bus for [`WorkflowEvent`]s.
///
/// Wraps a `tokio::sync::broadcast` channel. Cloning the bus clones the
/// sender, allowing multiple producers and consumers.
pub struct EventBus {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Create a new subscriber that will receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all current subscribers.
    ///
    /// If there are no subscribers, the event is silently dropped.
    pub fn publish(&self, event: WorkflowEvent) {
        let _ = self.sender.send(event);
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

/// Publish a lifecycle event to the bus and persist it through the store.
///
/// Persistence is best-effort: a store failure is logged and swallowed so it
/// never aborts the owning workflow operation.
pub(crate) async fn emit<S: WorkflowStore>(
    store: &S,
    bus: &EventBus,
    workflow_inst_id: Uuid,
    step_inst_id: Option<Uuid>,
    event_type: &str,
    event_data: HashMap<String, Value>,
) {
    let event = WorkflowEvent {
        id: Uuid::now_v7(),
        workflow_inst_id,
        step_inst_id,
        event_type: event_type.to_string(),
        event_data,
        timestamp: Utc::now(),
    };
    bus.publish(event.clone());
    if let Err(error) = store.save_event(&event).await {
        tracing::warn!(
            workflow = %workflow_inst_id,
            event_type,
            %error,
            "failed to persist workflow event"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn sample_event(event_type: &str) -> WorkflowEvent {
        WorkflowEvent {
            id: Uuid::now_v7(),
            workflow_inst_id: Uuid::now_v7(),
            step_inst_id: None,
            event_type: event_type.to_string(),
            event_data: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn publish_and_subscribe_delivers_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(sample_event("workflow.started"));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type, "workflow.started");
    }

    #[tokio::test]
    async fn multiple_subscribers_each_receive_event() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(sample_event("step.completed"));

        assert_eq!(rx1.recv().await.unwrap().event_type, "step.completed");
        assert_eq!(rx2.recv().await.unwrap().event_type, "step.completed");
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new(16);
        bus.publish(sample_event("workflow.started"));
        bus.publish(sample_event("workflow.completed"));
    }

    #[test]
    fn clone_shares_channel() {
        let bus = EventBus::new(16);
        let bus2 = bus.clone();
        let mut rx = bus.subscribe();

        bus2.publish(sample_event("step.started"));

        assert!(rx.try_recv().is_ok());
    }
}
