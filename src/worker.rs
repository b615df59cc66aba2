use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, Notify};
use uuid::Uuid;

use crate::client::{OutboundRequest, WebhookClient};
use crate::error::{DeliveryOutcome, FailureReason};
use crate::retry::RetryPolicy;
use crate::signing::build_signature_headers;
use crate::storage::Storage;
use crate::types::{
    AttemptStatus, ChainState, ChainStatus, DeliveryAttempt, DeliveryId, DomainEvent, EventId,
    EventType, Subscription,
};

/// Fixed client identifier sent as `User-Agent`.
pub const USER_AGENT: &str = "Marketplace-Webhooks/1.0";

/// Response bodies are kept in the ledger up to this many characters.
pub const MAX_RESPONSE_BODY_CHARS: usize = 1000;

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

/// One attempt of one delivery chain.
///
/// The task carries a snapshot of the subscription taken at fan-out time,
/// so editing or deleting the subscription never changes a chain that is
/// already running.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryTask {
    pub delivery_id: DeliveryId,
    pub subscription: Subscription,
    pub event: DomainEvent,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Creation time of this attempt's ledger row.
    pub created_at: DateTime<Utc>,
    pub due_at: DateTime<Utc>,
}

impl DeliveryTask {
    pub fn first(subscription: Subscription, event: DomainEvent) -> Self {
        let now = Utc::now();
        Self {
            delivery_id: DeliveryId::new(),
            subscription,
            event,
            attempt: 1,
            created_at: now,
            due_at: now,
        }
    }

    /// The follow-up attempt, due at `due_at`.
    ///
    /// Its id is derived from this attempt's id, so re-running an attempt
    /// after a crash reschedules the same follow-up instead of a new one.
    pub fn next(&self, due_at: DateTime<Utc>) -> Self {
        Self {
            delivery_id: DeliveryId(Uuid::new_v5(&self.delivery_id.0, b"next-attempt")),
            subscription: self.subscription.clone(),
            event: self.event.clone(),
            attempt: self.attempt + 1,
            created_at: Utc::now(),
            due_at,
        }
    }

    pub fn retry_ceiling(&self) -> u32 {
        self.subscription.retry_attempts.max(1)
    }

    /// Ledger row for this attempt before it runs.
    pub fn pending_row(&self) -> DeliveryAttempt {
        DeliveryAttempt {
            id: self.delivery_id,
            subscription_id: self.subscription.id,
            event_id: self.event.id,
            event_type: self.event.event_type,
            attempt_number: self.attempt,
            status: AttemptStatus::Pending,
            response_status: None,
            response_body: None,
            error: None,
            created_at: self.created_at,
            completed_at: None,
            next_attempt_at: (self.attempt > 1).then_some(self.due_at),
        }
    }
}

/// JSON body POSTed to subscribers.
#[derive(Debug, Serialize)]
pub struct Envelope<'a> {
    pub event_id: EventId,
    pub event_type: EventType,
    pub timestamp: String,
    pub data: &'a serde_json::Value,
}

/// Build the callback for `task`: envelope body, identification headers and,
/// when the subscription has a secret, an HMAC signature of the body.
pub fn build_request(task: &DeliveryTask) -> Result<OutboundRequest, serde_json::Error> {
    let event = &task.event;
    let body = serde_json::to_vec(&Envelope {
        event_id: event.id,
        event_type: event.event_type,
        timestamp: event.occurred_at.to_rfc3339(),
        data: &event.data,
    })?;

    let mut headers = vec![
        ("Content-Type".to_string(), "application/json".to_string()),
        ("User-Agent".to_string(), USER_AGENT.to_string()),
        ("X-Webhook-ID".to_string(), task.subscription.id.to_string()),
        ("X-Event-Type".to_string(), event.event_type.to_string()),
        ("X-Delivery-ID".to_string(), task.delivery_id.to_string()),
    ];

    if let Some(secret) = task.subscription.secret.as_deref() {
        let signed = build_signature_headers(secret, &body, Utc::now().timestamp());
        headers.push((signed.timestamp.0.to_string(), signed.timestamp.1));
        headers.push((signed.signature.0.to_string(), signed.signature.1));
    }

    Ok(OutboundRequest {
        url: task.subscription.url.clone(),
        headers,
        body,
        timeout: Duration::from_secs(task.subscription.timeout_seconds.max(1)),
    })
}

/// Delivery ids currently handed to the worker pool.
///
/// Both fan-out and the scheduler may see the same due task; only the one
/// that claims it submits it.
#[derive(Default)]
pub struct InFlight {
    ids: Mutex<HashSet<DeliveryId>>,
}

impl InFlight {
    pub async fn claim(&self, id: DeliveryId) -> bool {
        self.ids.lock().await.insert(id)
    }

    pub async fn release(&self, id: DeliveryId) {
        self.ids.lock().await.remove(&id);
    }

    pub async fn len(&self) -> usize {
        self.ids.lock().await.len()
    }
}

/// Shared context for all workers.
pub struct WorkerContext {
    pub storage: Arc<dyn Storage>,
    pub client: Arc<dyn WebhookClient>,
    pub retry: RetryPolicy,
    pub in_flight: InFlight,
    /// Wakes the scheduler when a retry is scheduled.
    pub notify: Arc<Notify>,
    pub is_running: Arc<AtomicBool>,
}

/// Result of a single delivery attempt.
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    pub task: DeliveryTask,
    pub outcome: DeliveryOutcome,
    pub response_status: Option<u16>,
    pub response_body: Option<String>,
    pub completed_at: DateTime<Utc>,
}

/// Main worker loop.
///
/// Each worker pulls tasks from the shared queue, performs the attempt and
/// records the result. Backoff never happens here: a failed attempt is
/// turned into a scheduled follow-up and the worker moves on.
pub async fn worker_loop(rx: Arc<Mutex<mpsc::Receiver<DeliveryTask>>>, ctx: Arc<WorkerContext>) {
    loop {
        let task = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };

        let Some(task) = task else { break };
        let delivery_id = task.delivery_id;

        if !ctx.is_running.load(Ordering::SeqCst) {
            // Still persisted in the schedule; picked up again after restart.
            ctx.in_flight.release(delivery_id).await;
            continue;
        }

        begin_attempt(&task, &ctx).await;
        let report = process_task(task, ctx.client.as_ref()).await;
        handle_report(&report, &ctx).await;
        ctx.in_flight.release(delivery_id).await;
    }
}

/// Move a retried chain from `failed_retrying` back to `pending` as its
/// next attempt starts. First attempts are already pending.
pub async fn begin_attempt(task: &DeliveryTask, ctx: &WorkerContext) {
    if task.attempt <= 1 {
        return;
    }

    let storage = ctx.storage.as_ref();
    let previous = match storage.load_chain(task.subscription.id, task.event.id).await {
        Ok(previous) => previous,
        Err(err) => {
            tracing::error!(
                target: "webhook_delivery",
                delivery_id = %task.delivery_id,
                error = %err,
                "Failed to load delivery chain state"
            );
            return;
        }
    };

    let state = ChainState {
        subscription_id: task.subscription.id,
        event_id: task.event.id,
        status: ChainStatus::Pending,
        attempts: task.attempt - 1,
        last_error: previous.and_then(|p| p.last_error),
        updated_at: Utc::now(),
    };
    if let Err(err) = storage.record_chain(&state).await {
        tracing::error!(
            target: "webhook_delivery",
            delivery_id = %task.delivery_id,
            error = %err,
            "Failed to record delivery chain state"
        );
    }
}

/// Perform one HTTP attempt and classify it. Never touches storage.
pub async fn process_task(task: DeliveryTask, client: &dyn WebhookClient) -> DeliveryReport {
    let request = match build_request(&task) {
        Ok(request) => request,
        Err(err) => {
            return DeliveryReport {
                task,
                outcome: DeliveryOutcome::Failed(FailureReason::Request(format!(
                    "failed to serialize payload: {err}"
                ))),
                response_status: None,
                response_body: None,
                completed_at: Utc::now(),
            };
        }
    };

    let result = client.post(request).await;
    let completed_at = Utc::now();

    match result {
        Ok(response) => {
            let body = truncate_body(&response.body);
            let outcome = if response.status < 400 {
                DeliveryOutcome::Delivered
            } else {
                DeliveryOutcome::Failed(FailureReason::HttpStatus(response.status))
            };
            DeliveryReport {
                task,
                outcome,
                response_status: Some(response.status),
                response_body: Some(body),
                completed_at,
            }
        }
        Err(reason) => DeliveryReport {
            task,
            outcome: DeliveryOutcome::Failed(reason),
            response_status: None,
            response_body: None,
            completed_at,
        },
    }
}

/// Record an attempt's result: complete its ledger row, schedule the
/// follow-up or close the chain, and update the chain state.
///
/// Storage failures are logged and swallowed. The attempt's own schedule
/// entry is only removed once its follow-up is safely scheduled, so a
/// failed write means the attempt runs again rather than being lost.
pub async fn handle_report(report: &DeliveryReport, ctx: &WorkerContext) -> ChainStatus {
    let task = &report.task;
    let storage = ctx.storage.as_ref();

    let mut row = task.pending_row();
    row.response_status = report.response_status;
    row.response_body = report.response_body.clone();
    row.completed_at = Some(report.completed_at);

    let (status, last_error, unschedule) = match &report.outcome {
        DeliveryOutcome::Delivered => {
            row.status = AttemptStatus::Success;
            metric_inc("webhook.delivery.success");
            tracing::info!(
                target: "webhook_delivery",
                delivery_id = %task.delivery_id,
                subscription_id = %task.subscription.id,
                event_id = %task.event.id,
                attempt = task.attempt,
                status = report.response_status,
                "Webhook delivered"
            );
            (ChainStatus::Success, None, true)
        }
        DeliveryOutcome::Failed(reason) => {
            row.status = AttemptStatus::Failed;
            row.error = Some(reason.to_string());
            metric_inc("webhook.delivery.failure");

            if task.attempt < task.retry_ceiling() {
                let delay = ctx.retry.next_delay(task.attempt);
                let due_at = chrono::Duration::from_std(delay)
                    .ok()
                    .and_then(|d| report.completed_at.checked_add_signed(d))
                    .unwrap_or(report.completed_at);
                let scheduled = schedule_follow_up(task, due_at, ctx).await;

                tracing::warn!(
                    target: "webhook_delivery",
                    delivery_id = %task.delivery_id,
                    subscription_id = %task.subscription.id,
                    event_id = %task.event.id,
                    attempt = task.attempt,
                    error = %reason,
                    next_attempt_at = %due_at,
                    "Webhook delivery failed, retry scheduled"
                );
                (ChainStatus::FailedRetrying, Some(reason.to_string()), scheduled)
            } else {
                metric_inc("webhook.delivery.exhausted");
                tracing::error!(
                    target: "webhook_delivery",
                    delivery_id = %task.delivery_id,
                    subscription_id = %task.subscription.id,
                    event_id = %task.event.id,
                    attempt = task.attempt,
                    error = %reason,
                    "Webhook delivery failed, retries exhausted"
                );
                (ChainStatus::FailedExhausted, Some(reason.to_string()), true)
            }
        }
    };

    if let Err(err) = storage.update_attempt(&row).await {
        tracing::error!(
            target: "webhook_delivery",
            delivery_id = %task.delivery_id,
            error = %err,
            "Failed to record delivery attempt"
        );
    }

    let state = ChainState {
        subscription_id: task.subscription.id,
        event_id: task.event.id,
        status,
        attempts: task.attempt,
        last_error,
        updated_at: report.completed_at,
    };
    if let Err(err) = storage.record_chain(&state).await {
        tracing::error!(
            target: "webhook_delivery",
            subscription_id = %task.subscription.id,
            event_id = %task.event.id,
            error = %err,
            "Failed to record delivery chain state"
        );
    }

    if unschedule {
        if let Err(err) = storage.unschedule(task.delivery_id).await {
            tracing::error!(
                target: "webhook_delivery",
                delivery_id = %task.delivery_id,
                error = %err,
                "Failed to clear scheduled delivery"
            );
        }
    }

    status
}

async fn schedule_follow_up(
    task: &DeliveryTask,
    due_at: DateTime<Utc>,
    ctx: &WorkerContext,
) -> bool {
    let next = task.next(due_at);

    if let Err(err) = ctx.storage.schedule(&next, due_at).await {
        tracing::error!(
            target: "webhook_delivery",
            delivery_id = %task.delivery_id,
            error = %err,
            "Failed to schedule retry; attempt will be re-run"
        );
        return false;
    }

    if let Err(err) = ctx.storage.update_attempt(&next.pending_row()).await {
        tracing::error!(
            target: "webhook_delivery",
            delivery_id = %next.delivery_id,
            error = %err,
            "Failed to record pending retry"
        );
    }

    metric_inc("webhook.delivery.retry_scheduled");
    ctx.notify.notify_one();
    true
}

fn truncate_body(body: &str) -> String {
    body.chars().take(MAX_RESPONSE_BODY_CHARS).collect()
}
