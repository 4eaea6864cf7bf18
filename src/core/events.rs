use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;

use crate::models::{CapacityBudget, Operation, ResourceId, ResourceStatus};

pub const EVENT_RESOURCE_STATUS: &str = "resource-status";
pub const EVENT_OPERATION_UPDATED: &str = "operation-updated";
pub const EVENT_CAPACITY_CHANGED: &str = "capacity-changed";

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum LifecycleEvent {
    #[serde(rename_all = "camelCase")]
    ResourceStatus {
        resource_id: ResourceId,
        previous: ResourceStatus,
        current: ResourceStatus,
    },
    OperationUpdated(Operation),
    CapacityChanged(CapacityBudget),
}

impl LifecycleEvent {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::ResourceStatus { .. } => EVENT_RESOURCE_STATUS,
            LifecycleEvent::OperationUpdated(_) => EVENT_OPERATION_UPDATED,
            LifecycleEvent::CapacityChanged(_) => EVENT_CAPACITY_CHANGED,
        }
    }
}

/// Fans lifecycle events out to any number of subscribers. Publishing never
/// blocks; receivers that were dropped are pruned on the next publish.
#[derive(Default)]
pub struct EventHub {
    subscribers: Mutex<Vec<Sender<LifecycleEvent>>>,
}

impl EventHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<LifecycleEvent> {
        let (sender, receiver) = unbounded();
        self.subscribers.lock().push(sender);
        receiver
    }

    pub fn publish(&self, event: LifecycleEvent) {
        let mut subscribers = self.subscribers.lock();
        if subscribers.is_empty() {
            return;
        }
        subscribers.retain(|sender| sender.send(event.clone()).is_ok());
    }

    pub fn emit_resource_status(
        &self,
        resource_id: &ResourceId,
        previous: ResourceStatus,
        current: ResourceStatus,
    ) {
        if previous == current {
            return;
        }
        self.publish(LifecycleEvent::ResourceStatus {
            resource_id: resource_id.clone(),
            previous,
            current,
        });
    }

    pub fn emit_operation(&self, operation: &Operation) {
        self.publish(LifecycleEvent::OperationUpdated(operation.clone()));
    }

    pub fn emit_capacity(&self, budget: CapacityBudget) {
        self.publish(LifecycleEvent::CapacityChanged(budget));
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_subscribers_are_pruned() {
        let hub = EventHub::new();
        let kept = hub.subscribe();
        let dropped = hub.subscribe();
        drop(dropped);

        hub.emit_capacity(CapacityBudget::new(10, 10));
        assert_eq!(hub.subscriber_count(), 1);
        let event = kept.try_recv().unwrap();
        assert_eq!(event.name(), EVENT_CAPACITY_CHANGED);
    }

    #[test]
    fn unchanged_status_is_not_published() {
        let hub = EventHub::new();
        let receiver = hub.subscribe();
        let id = ResourceId::parse("llm").unwrap();
        hub.emit_resource_status(&id, ResourceStatus::Loaded, ResourceStatus::Loaded);
        assert!(receiver.try_recv().is_err());

        hub.emit_resource_status(&id, ResourceStatus::Unloaded, ResourceStatus::Loading);
        let event = receiver.try_recv().unwrap();
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "resourceStatus");
        assert_eq!(json["current"], "loading");
    }
}
