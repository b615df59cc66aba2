use std::sync::Arc;

use chrono::Utc;

use crate::error::WebhookError;
use crate::storage::Storage;
use crate::types::{DomainEvent, EventId, EventType};

/// Persists each triggered domain event exactly once, before any fan-out.
#[derive(Clone)]
pub struct EventRecorder {
    storage: Arc<dyn Storage>,
}

impl EventRecorder {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Record an event with a fresh id and server timestamp.
    ///
    /// A storage failure is returned to the caller, who decides whether to
    /// retry; nothing is fanned out for an event that was not recorded.
    pub async fn record(
        &self,
        event_type: EventType,
        data: serde_json::Value,
    ) -> Result<DomainEvent, WebhookError> {
        let event = DomainEvent {
            id: EventId::new(),
            event_type,
            data,
            occurred_at: Utc::now(),
        };
        self.storage.insert_event(&event).await?;
        tracing::debug!(
            target: "webhook_delivery",
            event_id = %event.id,
            event_type = %event.event_type,
            "Domain event recorded"
        );
        Ok(event)
    }

    pub async fn get(&self, id: EventId) -> Result<DomainEvent, WebhookError> {
        self.storage
            .get_event(id)
            .await?
            .ok_or(WebhookError::EventNotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;

    #[tokio::test]
    async fn recorded_event_can_be_read_back() {
        let recorder = EventRecorder::new(Arc::new(InMemoryStorage::new()));
        let event = recorder
            .record(EventType::OrderCreated, serde_json::json!({ "order": 7 }))
            .await
            .unwrap();
        assert_eq!(recorder.get(event.id).await.unwrap(), event);
    }

    #[tokio::test]
    async fn each_record_gets_a_new_id() {
        let recorder = EventRecorder::new(Arc::new(InMemoryStorage::new()));
        let a = recorder.record(EventType::UserRegistered, serde_json::Value::Null).await.unwrap();
        let b = recorder.record(EventType::UserRegistered, serde_json::Value::Null).await.unwrap();
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn storage_outage_is_surfaced() {
        let storage = Arc::new(InMemoryStorage::new());
        storage.set_unavailable(true);
        let recorder = EventRecorder::new(storage);
        let err = recorder
            .record(EventType::ListingCreated, serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, WebhookError::Storage(_)));
    }

    #[tokio::test]
    async fn unknown_event_is_not_found() {
        let recorder = EventRecorder::new(Arc::new(InMemoryStorage::new()));
        assert!(recorder.get(EventId::new()).await.unwrap_err().is_not_found());
    }
}
