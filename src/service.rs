use std::sync::Arc;

use tokio::sync::RwLock;

use crate::client::WebhookClient;
use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::error::WebhookError;
use crate::ledger::Ledger;
use crate::recorder::EventRecorder;
use crate::registry::Registry;
use crate::storage::Storage;
use crate::types::{DeliveryChainHandle, DomainEvent, EventType};

/// The assembled engine. Built once at startup and handed to whoever
/// needs it; there is no process-wide accessor.
pub struct WebhookService {
    registry: Registry,
    recorder: EventRecorder,
    ledger: Ledger,
    dispatcher: RwLock<Dispatcher>,
}

impl WebhookService {
    /// Wire every component to the same storage and start the dispatcher.
    /// Must be called from within a tokio runtime.
    pub fn new(
        storage: Arc<dyn Storage>,
        client: Arc<dyn WebhookClient>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            registry: Registry::new(storage.clone()),
            recorder: EventRecorder::new(storage.clone()),
            ledger: Ledger::new(storage.clone()),
            dispatcher: RwLock::new(Dispatcher::new(config, storage, client)),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn recorder(&self) -> &EventRecorder {
        &self.recorder
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Record a domain event and fan it out.
    ///
    /// Only a failure to record is returned. Delivery problems, including a
    /// failed fan-out, are logged and end up in the ledger; they never reach
    /// the code path that produced the event.
    pub async fn trigger(
        &self,
        event_type: EventType,
        data: serde_json::Value,
    ) -> Result<(DomainEvent, Vec<DeliveryChainHandle>), WebhookError> {
        let event = self.recorder.record(event_type, data).await?;

        let chains = match self.dispatcher.read().await.fanout(&event).await {
            Ok(chains) => chains,
            Err(err) => {
                tracing::error!(
                    target: "webhook_delivery",
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %err,
                    "Fan-out failed"
                );
                Vec::new()
            }
        };

        Ok((event, chains))
    }

    pub async fn in_flight(&self) -> usize {
        self.dispatcher.read().await.in_flight().await
    }

    /// Stop the dispatcher. Scheduled attempts stay persisted and resume on
    /// the next start.
    pub async fn shutdown(&self) {
        self.dispatcher.write().await.shutdown().await;
        tracing::info!(target: "webhook_delivery", "Webhook dispatcher stopped");
    }
}
