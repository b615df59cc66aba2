//! Webhook subscription registry.
//!
//! Validates and persists subscriptions. Changes take effect at the next
//! fan-out; chains already running keep the snapshot they started with.

use std::sync::Arc;

use chrono::Utc;

use crate::error::WebhookError;
use crate::storage::Storage;
use crate::types::{
    Interest, NewSubscription, Subscription, SubscriptionId, SubscriptionPatch,
    DEFAULT_RETRY_ATTEMPTS, DEFAULT_TIMEOUT_SECONDS,
};

pub const MAX_RETRY_ATTEMPTS: u32 = 10;
pub const MAX_TIMEOUT_SECONDS: u64 = 300;

#[derive(Clone)]
pub struct Registry {
    storage: Arc<dyn Storage>,
}

impl Registry {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Register a new subscription.
    pub async fn register(&self, request: NewSubscription) -> Result<Subscription, WebhookError> {
        validate_url(&request.url)?;
        let interest = Interest::try_from(request.events)?;
        let retry_attempts = validate_retry_attempts(
            request.retry_attempts.unwrap_or(DEFAULT_RETRY_ATTEMPTS),
        )?;
        let timeout_seconds =
            validate_timeout(request.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECONDS))?;

        let now = Utc::now();
        let subscription = Subscription {
            id: SubscriptionId::new(),
            url: request.url,
            interest,
            name: request.name,
            description: request.description,
            active: request.active.unwrap_or(true),
            secret: request.secret.filter(|s| !s.is_empty()),
            retry_attempts,
            timeout_seconds,
            created_at: now,
            updated_at: now,
        };

        self.storage.insert_subscription(&subscription).await?;
        tracing::info!(
            target: "webhook_registry",
            subscription_id = %subscription.id,
            url = %subscription.url,
            "Webhook subscription registered"
        );
        Ok(subscription)
    }

    /// All subscriptions, newest first.
    pub async fn list(&self) -> Result<Vec<Subscription>, WebhookError> {
        Ok(self.storage.list_subscriptions().await?)
    }

    pub async fn get(&self, id: SubscriptionId) -> Result<Subscription, WebhookError> {
        self.storage
            .get_subscription(id)
            .await?
            .ok_or(WebhookError::SubscriptionNotFound(id))
    }

    /// Apply a partial update. An empty patch only bumps `updated_at`.
    pub async fn update(
        &self,
        id: SubscriptionId,
        patch: SubscriptionPatch,
    ) -> Result<Subscription, WebhookError> {
        let mut subscription = self.get(id).await?;

        if let Some(url) = patch.url {
            validate_url(&url)?;
            subscription.url = url;
        }
        if let Some(events) = patch.events {
            subscription.interest = Interest::try_from(events)?;
        }
        if let Some(retry_attempts) = patch.retry_attempts {
            subscription.retry_attempts = validate_retry_attempts(retry_attempts)?;
        }
        if let Some(timeout_seconds) = patch.timeout_seconds {
            subscription.timeout_seconds = validate_timeout(timeout_seconds)?;
        }
        if let Some(name) = patch.name {
            subscription.name = Some(name);
        }
        if let Some(description) = patch.description {
            subscription.description = Some(description);
        }
        if let Some(active) = patch.active {
            subscription.active = active;
        }
        if let Some(secret) = patch.secret {
            subscription.secret = (!secret.is_empty()).then_some(secret);
        }
        subscription.updated_at = Utc::now();

        if !self.storage.update_subscription(&subscription).await? {
            return Err(WebhookError::SubscriptionNotFound(id));
        }
        Ok(subscription)
    }

    /// Returns `false` if the subscription did not exist.
    pub async fn delete(&self, id: SubscriptionId) -> Result<bool, WebhookError> {
        let deleted = self.storage.delete_subscription(id).await?;
        if deleted {
            tracing::info!(
                target: "webhook_registry",
                subscription_id = %id,
                "Webhook subscription deleted"
            );
        }
        Ok(deleted)
    }
}

fn validate_url(url: &str) -> Result<(), WebhookError> {
    if url.trim().is_empty() {
        return Err(WebhookError::Validation("url must not be empty".to_string()));
    }
    let parsed = url::Url::parse(url)
        .map_err(|e| WebhookError::Validation(format!("invalid url: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(WebhookError::Validation(format!(
                "unsupported url scheme: {scheme}"
            )))
        }
    }
    if parsed.host_str().is_none() {
        return Err(WebhookError::Validation("url must have a host".to_string()));
    }
    Ok(())
}

fn validate_retry_attempts(value: u32) -> Result<u32, WebhookError> {
    if (1..=MAX_RETRY_ATTEMPTS).contains(&value) {
        Ok(value)
    } else {
        Err(WebhookError::Validation(format!(
            "retry_attempts must be between 1 and {MAX_RETRY_ATTEMPTS}"
        )))
    }
}

fn validate_timeout(value: u64) -> Result<u64, WebhookError> {
    if (1..=MAX_TIMEOUT_SECONDS).contains(&value) {
        Ok(value)
    } else {
        Err(WebhookError::Validation(format!(
            "timeout_seconds must be between 1 and {MAX_TIMEOUT_SECONDS}"
        )))
    }
}
