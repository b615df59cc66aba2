use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::StorageError;
use crate::types::{
    ChainState, DeliveryAttempt, DeliveryId, DomainEvent, EventId, Subscription, SubscriptionId,
};
use crate::worker::DeliveryTask;

/// Persistence collaborator.
///
/// Four logical collections: subscriptions, events, delivery attempts (the
/// ledger, plus per-chain state) and the schedule of due delivery tasks.
/// The schedule is what makes retries survive a restart: a task is only
/// removed from it once the attempt it describes has completed.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn insert_subscription(&self, subscription: &Subscription) -> Result<(), StorageError>;
    /// Returns `false` if no subscription with that id exists.
    async fn update_subscription(&self, subscription: &Subscription)
        -> Result<bool, StorageError>;
    async fn get_subscription(
        &self,
        id: SubscriptionId,
    ) -> Result<Option<Subscription>, StorageError>;
    /// All subscriptions, newest first, read as one snapshot.
    async fn list_subscriptions(&self) -> Result<Vec<Subscription>, StorageError>;
    async fn delete_subscription(&self, id: SubscriptionId) -> Result<bool, StorageError>;

    async fn insert_event(&self, event: &DomainEvent) -> Result<(), StorageError>;
    async fn get_event(&self, id: EventId) -> Result<Option<DomainEvent>, StorageError>;

    async fn insert_attempt(&self, attempt: &DeliveryAttempt) -> Result<(), StorageError>;
    async fn update_attempt(&self, attempt: &DeliveryAttempt) -> Result<(), StorageError>;
    async fn get_attempt(&self, id: DeliveryId) -> Result<Option<DeliveryAttempt>, StorageError>;
    /// Newest first.
    async fn list_attempts(
        &self,
        subscription_id: Option<SubscriptionId>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<DeliveryAttempt>, StorageError>;

    async fn record_chain(&self, state: &ChainState) -> Result<(), StorageError>;
    async fn load_chain(
        &self,
        subscription_id: SubscriptionId,
        event_id: EventId,
    ) -> Result<Option<ChainState>, StorageError>;

    async fn schedule(&self, task: &DeliveryTask, due_at: DateTime<Utc>)
        -> Result<(), StorageError>;
    async fn unschedule(&self, delivery_id: DeliveryId) -> Result<(), StorageError>;
    async fn is_scheduled(&self, delivery_id: DeliveryId) -> Result<bool, StorageError>;
    /// Tasks due at or before `now`, earliest first.
    async fn load_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryTask>, StorageError>;
    async fn next_due_at(&self) -> Result<Option<DateTime<Utc>>, StorageError>;
}

#[derive(Debug, Clone)]
struct ScheduledTask {
    task: DeliveryTask,
    due_at: DateTime<Utc>,
}

/// In-memory storage for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryStorage {
    subscriptions: Mutex<Vec<Subscription>>,
    events: Mutex<HashMap<EventId, DomainEvent>>,
    attempts: Mutex<Vec<DeliveryAttempt>>,
    chains: Mutex<HashMap<(SubscriptionId, EventId), ChainState>>,
    scheduled: Mutex<HashMap<DeliveryId, ScheduledTask>>,
    unavailable: AtomicBool,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every call fails until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StorageError::Unavailable("in-memory storage marked unavailable".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn insert_subscription(&self, subscription: &Subscription) -> Result<(), StorageError> {
        self.check()?;
        self.subscriptions.lock().await.push(subscription.clone());
        Ok(())
    }

    async fn update_subscription(
        &self,
        subscription: &Subscription,
    ) -> Result<bool, StorageError> {
        self.check()?;
        let mut guard = self.subscriptions.lock().await;
        match guard.iter_mut().find(|s| s.id == subscription.id) {
            Some(existing) => {
                *existing = subscription.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_subscription(
        &self,
        id: SubscriptionId,
    ) -> Result<Option<Subscription>, StorageError> {
        self.check()?;
        let guard = self.subscriptions.lock().await;
        Ok(guard.iter().find(|s| s.id == id).cloned())
    }

    async fn list_subscriptions(&self) -> Result<Vec<Subscription>, StorageError> {
        self.check()?;
        let mut items: Vec<Subscription> =
            self.subscriptions.lock().await.iter().rev().cloned().collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(items)
    }

    async fn delete_subscription(&self, id: SubscriptionId) -> Result<bool, StorageError> {
        self.check()?;
        let mut guard = self.subscriptions.lock().await;
        let before = guard.len();
        guard.retain(|s| s.id != id);
        Ok(guard.len() != before)
    }

    async fn insert_event(&self, event: &DomainEvent) -> Result<(), StorageError> {
        self.check()?;
        self.events.lock().await.insert(event.id, event.clone());
        Ok(())
    }

    async fn get_event(&self, id: EventId) -> Result<Option<DomainEvent>, StorageError> {
        self.check()?;
        Ok(self.events.lock().await.get(&id).cloned())
    }

    async fn insert_attempt(&self, attempt: &DeliveryAttempt) -> Result<(), StorageError> {
        self.check()?;
        self.attempts.lock().await.push(attempt.clone());
        Ok(())
    }

    async fn update_attempt(&self, attempt: &DeliveryAttempt) -> Result<(), StorageError> {
        self.check()?;
        let mut guard = self.attempts.lock().await;
        match guard.iter_mut().rev().find(|a| a.id == attempt.id) {
            Some(existing) => *existing = attempt.clone(),
            None => guard.push(attempt.clone()),
        }
        Ok(())
    }

    async fn get_attempt(&self, id: DeliveryId) -> Result<Option<DeliveryAttempt>, StorageError> {
        self.check()?;
        let guard = self.attempts.lock().await;
        Ok(guard.iter().find(|a| a.id == id).cloned())
    }

    async fn list_attempts(
        &self,
        subscription_id: Option<SubscriptionId>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<DeliveryAttempt>, StorageError> {
        self.check()?;
        let guard = self.attempts.lock().await;
        let mut items: Vec<DeliveryAttempt> = guard
            .iter()
            .rev()
            .filter(|a| subscription_id.map_or(true, |id| a.subscription_id == id))
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(items.into_iter().skip(offset).take(limit).collect())
    }

    async fn record_chain(&self, state: &ChainState) -> Result<(), StorageError> {
        self.check()?;
        self.chains
            .lock()
            .await
            .insert((state.subscription_id, state.event_id), state.clone());
        Ok(())
    }

    async fn load_chain(
        &self,
        subscription_id: SubscriptionId,
        event_id: EventId,
    ) -> Result<Option<ChainState>, StorageError> {
        self.check()?;
        Ok(self
            .chains
            .lock()
            .await
            .get(&(subscription_id, event_id))
            .cloned())
    }

    async fn schedule(
        &self,
        task: &DeliveryTask,
        due_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.check()?;
        self.scheduled.lock().await.insert(
            task.delivery_id,
            ScheduledTask {
                task: task.clone(),
                due_at,
            },
        );
        Ok(())
    }

    async fn unschedule(&self, delivery_id: DeliveryId) -> Result<(), StorageError> {
        self.check()?;
        self.scheduled.lock().await.remove(&delivery_id);
        Ok(())
    }

    async fn is_scheduled(&self, delivery_id: DeliveryId) -> Result<bool, StorageError> {
        self.check()?;
        Ok(self.scheduled.lock().await.contains_key(&delivery_id))
    }

    async fn load_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryTask>, StorageError> {
        self.check()?;
        let guard = self.scheduled.lock().await;
        let mut due: Vec<&ScheduledTask> = guard.values().filter(|s| s.due_at <= now).collect();
        due.sort_by_key(|s| s.due_at);
        Ok(due.into_iter().take(limit).map(|s| s.task.clone()).collect())
    }

    async fn next_due_at(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        self.check()?;
        Ok(self.scheduled.lock().await.values().map(|s| s.due_at).min())
    }
}
