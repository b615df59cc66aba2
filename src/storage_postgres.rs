use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::{Client, Row};

use crate::error::StorageError;
use crate::storage::Storage;
use crate::types::{
    ChainState, DeliveryAttempt, DeliveryId, DomainEvent, EventId, Subscription, SubscriptionId,
};
use crate::worker::DeliveryTask;

/// Postgres-backed [`Storage`].
///
/// Every record is kept whole as JSONB; only the columns used for lookup
/// and ordering are broken out.
pub struct PostgresStorage {
    client: Client,
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS webhook_subscriptions (
        id TEXT PRIMARY KEY,
        created_at TIMESTAMPTZ NOT NULL,
        payload JSONB NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS webhook_events (
        id TEXT PRIMARY KEY,
        payload JSONB NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS webhook_delivery_attempts (
        id TEXT PRIMARY KEY,
        subscription_id TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        payload JSONB NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS webhook_delivery_attempts_sub_idx
        ON webhook_delivery_attempts (subscription_id, created_at DESC)",
    "CREATE TABLE IF NOT EXISTS webhook_chains (
        id TEXT PRIMARY KEY,
        payload JSONB NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS webhook_schedule (
        id TEXT PRIMARY KEY,
        due_at TIMESTAMPTZ NOT NULL,
        payload JSONB NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS webhook_schedule_due_idx ON webhook_schedule (due_at)",
];

impl PostgresStorage {
    /// Wrap a connected client, creating the tables if they do not exist.
    pub async fn new(client: Client) -> Result<Self, StorageError> {
        for statement in SCHEMA {
            client.execute(*statement, &[]).await?;
        }
        Ok(Self { client })
    }

    fn chain_key(subscription_id: SubscriptionId, event_id: EventId) -> String {
        format!("{subscription_id}|{event_id}")
    }

    async fn upsert(
        &self,
        table: &str,
        id: String,
        payload: serde_json::Value,
    ) -> Result<(), StorageError> {
        let sql = format!(
            "INSERT INTO {table} (id, payload) VALUES ($1, $2)
             ON CONFLICT (id) DO UPDATE SET payload = EXCLUDED.payload"
        );
        self.client.execute(sql.as_str(), &[&id, &payload]).await?;
        Ok(())
    }
}

fn decode<T: serde::de::DeserializeOwned>(row: &Row) -> Result<T, StorageError> {
    let payload: serde_json::Value = row.try_get("payload")?;
    Ok(serde_json::from_value(payload)?)
}

fn decode_all<T: serde::de::DeserializeOwned>(rows: &[Row]) -> Result<Vec<T>, StorageError> {
    rows.iter().map(decode).collect()
}

fn as_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn insert_subscription(&self, subscription: &Subscription) -> Result<(), StorageError> {
        let payload = serde_json::to_value(subscription)?;
        self.client
            .execute(
                "INSERT INTO webhook_subscriptions (id, created_at, payload) VALUES ($1, $2, $3)",
                &[&subscription.id.to_string(), &subscription.created_at, &payload],
            )
            .await?;
        Ok(())
    }

    async fn update_subscription(
        &self,
        subscription: &Subscription,
    ) -> Result<bool, StorageError> {
        let payload = serde_json::to_value(subscription)?;
        let updated = self
            .client
            .execute(
                "UPDATE webhook_subscriptions SET payload = $2 WHERE id = $1",
                &[&subscription.id.to_string(), &payload],
            )
            .await?;
        Ok(updated > 0)
    }

    async fn get_subscription(
        &self,
        id: SubscriptionId,
    ) -> Result<Option<Subscription>, StorageError> {
        let row = self
            .client
            .query_opt(
                "SELECT payload FROM webhook_subscriptions WHERE id = $1",
                &[&id.to_string()],
            )
            .await?;
        row.as_ref().map(decode).transpose()
    }

    async fn list_subscriptions(&self) -> Result<Vec<Subscription>, StorageError> {
        let rows = self
            .client
            .query(
                "SELECT payload FROM webhook_subscriptions ORDER BY created_at DESC",
                &[],
            )
            .await?;
        decode_all(&rows)
    }

    async fn delete_subscription(&self, id: SubscriptionId) -> Result<bool, StorageError> {
        let deleted = self
            .client
            .execute(
                "DELETE FROM webhook_subscriptions WHERE id = $1",
                &[&id.to_string()],
            )
            .await?;
        Ok(deleted > 0)
    }

    async fn insert_event(&self, event: &DomainEvent) -> Result<(), StorageError> {
        let payload = serde_json::to_value(event)?;
        self.client
            .execute(
                "INSERT INTO webhook_events (id, payload) VALUES ($1, $2)",
                &[&event.id.to_string(), &payload],
            )
            .await?;
        Ok(())
    }

    async fn get_event(&self, id: EventId) -> Result<Option<DomainEvent>, StorageError> {
        let row = self
            .client
            .query_opt(
                "SELECT payload FROM webhook_events WHERE id = $1",
                &[&id.to_string()],
            )
            .await?;
        row.as_ref().map(decode).transpose()
    }

    async fn insert_attempt(&self, attempt: &DeliveryAttempt) -> Result<(), StorageError> {
        self.update_attempt(attempt).await
    }

    async fn update_attempt(&self, attempt: &DeliveryAttempt) -> Result<(), StorageError> {
        let payload = serde_json::to_value(attempt)?;
        self.client
            .execute(
                "INSERT INTO webhook_delivery_attempts (id, subscription_id, created_at, payload)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (id) DO UPDATE SET payload = EXCLUDED.payload",
                &[
                    &attempt.id.to_string(),
                    &attempt.subscription_id.to_string(),
                    &attempt.created_at,
                    &payload,
                ],
            )
            .await?;
        Ok(())
    }

    async fn get_attempt(&self, id: DeliveryId) -> Result<Option<DeliveryAttempt>, StorageError> {
        let row = self
            .client
            .query_opt(
                "SELECT payload FROM webhook_delivery_attempts WHERE id = $1",
                &[&id.to_string()],
            )
            .await?;
        row.as_ref().map(decode).transpose()
    }

    async fn list_attempts(
        &self,
        subscription_id: Option<SubscriptionId>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<DeliveryAttempt>, StorageError> {
        let limit = as_i64(limit);
        let offset = as_i64(offset);
        let rows = match subscription_id {
            Some(id) => {
                self.client
                    .query(
                        "SELECT payload FROM webhook_delivery_attempts
                         WHERE subscription_id = $1
                         ORDER BY created_at DESC LIMIT $2 OFFSET $3",
                        &[&id.to_string(), &limit, &offset],
                    )
                    .await?
            }
            None => {
                self.client
                    .query(
                        "SELECT payload FROM webhook_delivery_attempts
                         ORDER BY created_at DESC LIMIT $1 OFFSET $2",
                        &[&limit, &offset],
                    )
                    .await?
            }
        };
        decode_all(&rows)
    }

    async fn record_chain(&self, state: &ChainState) -> Result<(), StorageError> {
        let id = Self::chain_key(state.subscription_id, state.event_id);
        self.upsert("webhook_chains", id, serde_json::to_value(state)?)
            .await
    }

    async fn load_chain(
        &self,
        subscription_id: SubscriptionId,
        event_id: EventId,
    ) -> Result<Option<ChainState>, StorageError> {
        let row = self
            .client
            .query_opt(
                "SELECT payload FROM webhook_chains WHERE id = $1",
                &[&Self::chain_key(subscription_id, event_id)],
            )
            .await?;
        row.as_ref().map(decode).transpose()
    }

    async fn schedule(
        &self,
        task: &DeliveryTask,
        due_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let payload = serde_json::to_value(task)?;
        self.client
            .execute(
                "INSERT INTO webhook_schedule (id, due_at, payload) VALUES ($1, $2, $3)
                 ON CONFLICT (id) DO UPDATE SET due_at = EXCLUDED.due_at, payload = EXCLUDED.payload",
                &[&task.delivery_id.to_string(), &due_at, &payload],
            )
            .await?;
        Ok(())
    }

    async fn unschedule(&self, delivery_id: DeliveryId) -> Result<(), StorageError> {
        self.client
            .execute(
                "DELETE FROM webhook_schedule WHERE id = $1",
                &[&delivery_id.to_string()],
            )
            .await?;
        Ok(())
    }

    async fn is_scheduled(&self, delivery_id: DeliveryId) -> Result<bool, StorageError> {
        let row = self
            .client
            .query_opt(
                "SELECT 1 FROM webhook_schedule WHERE id = $1",
                &[&delivery_id.to_string()],
            )
            .await?;
        Ok(row.is_some())
    }

    async fn load_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryTask>, StorageError> {
        let rows = self
            .client
            .query(
                "SELECT payload FROM webhook_schedule
                 WHERE due_at <= $1 ORDER BY due_at LIMIT $2",
                &[&now, &as_i64(limit)],
            )
            .await?;
        decode_all(&rows)
    }

    async fn next_due_at(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        let row = self
            .client
            .query_one("SELECT MIN(due_at) FROM webhook_schedule", &[])
            .await?;
        Ok(row.try_get(0)?)
    }
}
