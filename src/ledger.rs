//! Read side of the delivery history.
//!
//! Only the attempt engine writes attempt rows; this module never feeds
//! back into delivery decisions.

use std::sync::Arc;

use crate::error::WebhookError;
use crate::storage::Storage;
use crate::types::{
    ChainState, DeliveryAttempt, EventId, EventType, EventTypeInfo, SubscriptionId,
};

pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 500;

#[derive(Clone)]
pub struct Ledger {
    storage: Arc<dyn Storage>,
}

impl Ledger {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Attempts newest first, optionally for one subscription.
    ///
    /// `limit` defaults to 50 and is clamped to `1..=500`.
    pub async fn list_deliveries(
        &self,
        subscription_id: Option<SubscriptionId>,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Vec<DeliveryAttempt>, WebhookError> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let offset = offset.unwrap_or(0);
        Ok(self
            .storage
            .list_attempts(subscription_id, limit, offset)
            .await?)
    }

    /// Current state of the chain delivering `event_id` to `subscription_id`.
    pub async fn chain_state(
        &self,
        subscription_id: SubscriptionId,
        event_id: EventId,
    ) -> Result<ChainState, WebhookError> {
        self.storage
            .load_chain(subscription_id, event_id)
            .await?
            .ok_or(WebhookError::EventNotFound(event_id))
    }

    pub fn event_catalogue(&self) -> Vec<EventTypeInfo> {
        event_catalogue()
    }
}

/// Every supported event type with its subscriber-facing description.
pub fn event_catalogue() -> Vec<EventTypeInfo> {
    EventType::ALL
        .iter()
        .map(|t| EventTypeInfo {
            event: *t,
            description: t.description().to_string(),
        })
        .collect()
}
