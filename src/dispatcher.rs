use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::client::WebhookClient;
use crate::error::{DispatchError, StorageError, WebhookError};
use crate::retry::RetryPolicy;
use crate::storage::Storage;
use crate::types::{ChainState, ChainStatus, DeliveryChainHandle, DomainEvent};
use crate::worker::{worker_loop, DeliveryTask, InFlight, WorkerContext};

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Fixed size of the worker pool.
    pub worker_count: usize,
    /// Capacity of the ready queue between fan-out/scheduler and workers.
    pub queue_size: usize,
    /// Upper bound on how long the scheduler sleeps between schedule scans.
    pub poll_interval: Duration,
    /// Maximum due tasks moved per scan.
    pub scheduler_batch: usize,
    pub retry: RetryPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        let worker_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            worker_count,
            queue_size: 1_024,
            poll_interval: Duration::from_secs(1),
            scheduler_batch: 256,
            retry: RetryPolicy::default(),
        }
    }
}

/// Delivery dispatcher.
///
/// Fan-out persists attempt #1 of every matching chain together with a
/// "due now" schedule entry, then offers it to a bounded queue drained by a
/// fixed worker pool. If the queue is full the entry simply waits in storage
/// for the scheduler, so fan-out never blocks on delivery. The scheduler
/// also owns retries: it moves schedule entries whose due time has passed
/// into the queue.
pub struct Dispatcher {
    ready_tx: Option<mpsc::Sender<DeliveryTask>>,
    is_running: Arc<AtomicBool>,
    worker_handles: Vec<JoinHandle<()>>,
    scheduler_handle: Option<JoinHandle<()>>,
    ctx: Arc<WorkerContext>,
}

impl Dispatcher {
    /// Start the worker pool and the scheduler. Schedule entries left over
    /// from a previous run are picked up on the first scan.
    pub fn new(
        config: DispatcherConfig,
        storage: Arc<dyn Storage>,
        client: Arc<dyn WebhookClient>,
    ) -> Self {
        let (ready_tx, ready_rx) = mpsc::channel(config.queue_size.max(1));
        let shared_ready_rx = Arc::new(Mutex::new(ready_rx));
        let is_running = Arc::new(AtomicBool::new(true));

        let ctx = Arc::new(WorkerContext {
            storage,
            client,
            retry: config.retry.clone(),
            in_flight: InFlight::default(),
            notify: Arc::new(Notify::new()),
            is_running: is_running.clone(),
        });

        let worker_handles = (0..config.worker_count.max(1))
            .map(|_| tokio::spawn(worker_loop(shared_ready_rx.clone(), ctx.clone())))
            .collect();

        let scheduler_handle = tokio::spawn(scheduler_loop(
            ready_tx.clone(),
            ctx.clone(),
            config.poll_interval,
            config.scheduler_batch.max(1),
        ));

        Self {
            ready_tx: Some(ready_tx),
            is_running,
            worker_handles,
            scheduler_handle: Some(scheduler_handle),
            ctx,
        }
    }

    /// Start one delivery chain per active subscription interested in
    /// `event`.
    ///
    /// Subscriptions are read once, so concurrent registry edits are either
    /// fully visible to this fan-out or not at all. Returns as soon as the
    /// chains are persisted; zero matches is not an error.
    pub async fn fanout(
        &self,
        event: &DomainEvent,
    ) -> Result<Vec<DeliveryChainHandle>, WebhookError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(DispatchError::Shutdown.into());
        }

        let snapshot = self.ctx.storage.list_subscriptions().await?;
        let matching: Vec<_> = snapshot
            .into_iter()
            .filter(|s| s.wants(event.event_type))
            .collect();

        if matching.is_empty() {
            tracing::info!(
                target: "webhook_delivery",
                event_id = %event.id,
                event_type = %event.event_type,
                "No active subscriptions for event"
            );
            return Ok(Vec::new());
        }

        let mut handles = Vec::with_capacity(matching.len());
        for subscription in matching {
            let task = DeliveryTask::first(subscription, event.clone());
            let delivery_id = task.delivery_id;

            // Held until the task is queued so the scheduler cannot run it
            // while the chain is still being written.
            self.ctx.in_flight.claim(delivery_id).await;
            if let Err(err) = self.start_chain(&task).await {
                self.ctx.in_flight.release(delivery_id).await;
                tracing::error!(
                    target: "webhook_delivery",
                    event_id = %event.id,
                    subscription_id = %task.subscription.id,
                    error = %err,
                    "Failed to start delivery chain"
                );
                continue;
            }

            handles.push(DeliveryChainHandle {
                subscription_id: task.subscription.id,
                event_id: event.id,
                delivery_id,
            });
            self.submit(task).await;
        }

        tracing::debug!(
            target: "webhook_delivery",
            event_id = %event.id,
            chains = handles.len(),
            "Event fanned out"
        );
        Ok(handles)
    }

    /// Persist attempt #1. The schedule entry goes first: once it exists
    /// the chain will run, and the worker rewrites the ledger row and chain
    /// state when it completes. Later write failures are only logged.
    async fn start_chain(&self, task: &DeliveryTask) -> Result<(), StorageError> {
        let storage = self.ctx.storage.as_ref();
        storage.schedule(task, task.due_at).await?;

        if let Err(err) = storage.insert_attempt(&task.pending_row()).await {
            tracing::error!(
                target: "webhook_delivery",
                delivery_id = %task.delivery_id,
                error = %err,
                "Failed to record pending delivery attempt"
            );
        }
        let state = ChainState {
            subscription_id: task.subscription.id,
            event_id: task.event.id,
            status: ChainStatus::Pending,
            attempts: 0,
            last_error: None,
            updated_at: task.created_at,
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
        Ok(())
    }

    /// Offer a persisted, already claimed task to the worker pool without
    /// waiting. The claim is dropped if the queue cannot take it.
    async fn submit(&self, task: DeliveryTask) {
        let delivery_id = task.delivery_id;
        let Some(tx) = self.ready_tx.as_ref() else {
            self.ctx.in_flight.release(delivery_id).await;
            return;
        };

        match tx.try_send(task) {
            Ok(()) => metric_inc("webhook.dispatch.enqueued"),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.ctx.in_flight.release(delivery_id).await;
                metric_inc("webhook.dispatch.backpressure");
                tracing::debug!(
                    target: "webhook_delivery",
                    delivery_id = %delivery_id,
                    "Worker queue full; delivery left for the scheduler"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.ctx.in_flight.release(delivery_id).await;
            }
        }
    }

    /// Number of attempts currently queued or executing.
    pub async fn in_flight(&self) -> usize {
        self.ctx.in_flight.len().await
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Stop accepting fan-outs and wait for the scheduler and workers to
    /// finish. Attempts that have not started stay in the schedule.
    pub async fn shutdown(&mut self) {
        self.is_running.store(false, Ordering::SeqCst);
        self.ready_tx.take();
        self.ctx.notify.notify_one();

        if let Some(handle) = self.scheduler_handle.take() {
            let _ = handle.await;
        }

        for handle in self.worker_handles.drain(..) {
            let _ = handle.await;
        }
    }
}

async fn scheduler_loop(
    ready_tx: mpsc::Sender<DeliveryTask>,
    ctx: Arc<WorkerContext>,
    poll_interval: Duration,
    batch: usize,
) {
    while ctx.is_running.load(Ordering::SeqCst) {
        let mut submitted = 0usize;

        match ctx.storage.load_due(Utc::now(), batch).await {
            Ok(due) => {
                for task in due {
                    let delivery_id = task.delivery_id;
                    if !ctx.in_flight.claim(delivery_id).await {
                        continue;
                    }
                    // The previous holder may have finished it since the scan.
                    if !matches!(ctx.storage.is_scheduled(delivery_id).await, Ok(true)) {
                        ctx.in_flight.release(delivery_id).await;
                        continue;
                    }
                    if ready_tx.send(task).await.is_err() {
                        ctx.in_flight.release(delivery_id).await;
                        return;
                    }
                    submitted += 1;
                    metric_inc("webhook.scheduler.submitted");
                }
            }
            Err(err) => {
                tracing::error!(
                    target: "webhook_delivery",
                    error = %err,
                    "Failed to load due deliveries"
                );
            }
        }

        // A full batch means more may already be due.
        if submitted == batch {
            tokio::task::yield_now().await;
            continue;
        }

        let wait = match ctx.storage.next_due_at().await {
            Ok(Some(due_at)) => (due_at - Utc::now())
                .to_std()
                .ok()
                .filter(|d| !d.is_zero())
                .map_or(poll_interval, |d| d.min(poll_interval)),
            _ => poll_interval,
        };

        tokio::select! {
            _ = ctx.notify.notified() => {}
            _ = sleep(wait) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use crate::storage::InMemoryStorage;
    use crate::types::{
        AttemptStatus, DeliveryAttempt, DeliveryId, EventId, EventType, Interest, Subscription,
        SubscriptionId,
    };
    use crate::worker::tests::{event, subscription, ScriptedClient};

    fn fast_config() -> DispatcherConfig {
        DispatcherConfig {
            worker_count: 2,
            queue_size: 8,
            poll_interval: Duration::from_millis(10),
            scheduler_batch: 16,
            retry: RetryPolicy::new(Duration::from_millis(5), Duration::from_millis(50)),
        }
    }

    async fn wait_for_terminal(
        storage: &InMemoryStorage,
        handle: &DeliveryChainHandle,
    ) -> ChainState {
        for _ in 0..500 {
            if let Some(state) = storage
                .load_chain(handle.subscription_id, handle.event_id)
                .await
                .unwrap()
            {
                if state.status.is_terminal() {
                    return state;
                }
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("delivery chain did not finish");
    }

    #[tokio::test]
    async fn fanout_selects_only_interested_active_subscriptions() {
        let storage = Arc::new(InMemoryStorage::new());
        let client = Arc::new(ScriptedClient::default());

        let wildcard = subscription(3, None);
        let mut listing_only = subscription(3, None);
        listing_only.interest = Interest::Only(vec![EventType::ListingCreated]);
        let mut orders_only = subscription(3, None);
        orders_only.interest = Interest::Only(vec![EventType::OrderCompleted]);
        let mut inactive = subscription(3, None);
        inactive.active = false;
        for s in [&wildcard, &listing_only, &orders_only, &inactive] {
            storage.insert_subscription(s).await.unwrap();
        }

        let mut dispatcher = Dispatcher::new(fast_config(), storage.clone(), client);
        let handles = dispatcher.fanout(&event()).await.unwrap();

        let mut targeted: Vec<_> = handles.iter().map(|h| h.subscription_id).collect();
        targeted.sort();
        let mut expected = vec![wildcard.id, listing_only.id];
        expected.sort();
        assert_eq!(targeted, expected);

        for handle in &handles {
            assert_eq!(wait_for_terminal(&storage, handle).await.status, ChainStatus::Success);
        }
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn zero_matches_is_not_an_error() {
        let storage = Arc::new(InMemoryStorage::new());
        let mut dispatcher =
            Dispatcher::new(fast_config(), storage.clone(), Arc::new(ScriptedClient::default()));
        assert!(dispatcher.fanout(&event()).await.unwrap().is_empty());
        assert!(storage.list_attempts(None, 10, 0).await.unwrap().is_empty());
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn retries_until_ceiling_then_exhausts() {
        let storage = Arc::new(InMemoryStorage::new());
        let client = Arc::new(ScriptedClient::new(vec![
            ScriptedClient::status(500),
            ScriptedClient::status(500),
            ScriptedClient::status(500),
            ScriptedClient::status(200),
        ]));
        let sub = subscription(3, None);
        storage.insert_subscription(&sub).await.unwrap();

        let mut dispatcher = Dispatcher::new(fast_config(), storage.clone(), client.clone());
        let handles = dispatcher.fanout(&event()).await.unwrap();
        let state = wait_for_terminal(&storage, &handles[0]).await;
        assert_eq!(state.status, ChainStatus::FailedExhausted);
        assert_eq!(state.attempts, 3);

        // Give a stray fourth attempt the chance to show up.
        sleep(Duration::from_millis(100)).await;
        dispatcher.shutdown().await;

        let mut rows = storage.list_attempts(Some(sub.id), 50, 0).await.unwrap();
        rows.sort_by_key(|r| r.attempt_number);
        let numbers: Vec<u32> = rows.iter().map(|r| r.attempt_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert!(rows.iter().all(|r| r.status == AttemptStatus::Failed));
        assert_eq!(client.requests.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn full_queue_falls_back_to_scheduler() {
        let storage = Arc::new(InMemoryStorage::new());
        let client = Arc::new(ScriptedClient::default());
        for _ in 0..20 {
            storage.insert_subscription(&subscription(3, None)).await.unwrap();
        }

        let config = DispatcherConfig {
            worker_count: 1,
            queue_size: 1,
            ..fast_config()
        };
        let mut dispatcher = Dispatcher::new(config, storage.clone(), client.clone());
        let handles = dispatcher.fanout(&event()).await.unwrap();
        assert_eq!(handles.len(), 20);

        for handle in &handles {
            assert_eq!(wait_for_terminal(&storage, handle).await.status, ChainStatus::Success);
        }
        dispatcher.shutdown().await;

        // Every chain delivered exactly once despite both paths seeing it.
        assert_eq!(client.requests.lock().unwrap().len(), 20);
    }

    #[tokio::test]
    async fn pending_schedule_survives_restart() {
        let storage = Arc::new(InMemoryStorage::new());
        let sub = subscription(3, None);
        let task = DeliveryTask::first(sub.clone(), event());
        storage.insert_attempt(&task.pending_row()).await.unwrap();
        storage.schedule(&task, task.due_at).await.unwrap();

        let client = Arc::new(ScriptedClient::default());
        let mut dispatcher = Dispatcher::new(fast_config(), storage.clone(), client.clone());
        let handle = DeliveryChainHandle {
            subscription_id: sub.id,
            event_id: task.event.id,
            delivery_id: task.delivery_id,
        };
        assert_eq!(wait_for_terminal(&storage, &handle).await.status, ChainStatus::Success);
        dispatcher.shutdown().await;

        let row = storage.get_attempt(task.delivery_id).await.unwrap().unwrap();
        assert_eq!(row.status, AttemptStatus::Success);
    }

    /// Delegates to [`InMemoryStorage`] but fails the selected writes.
    #[derive(Default)]
    struct FailingWrites {
        inner: InMemoryStorage,
        fail_schedule: bool,
        fail_insert_attempt: bool,
    }

    impl FailingWrites {
        fn refused() -> StorageError {
            StorageError::Unavailable("write refused".into())
        }
    }

    #[async_trait::async_trait]
    impl Storage for FailingWrites {
        async fn insert_subscription(&self, s: &Subscription) -> Result<(), StorageError> {
            self.inner.insert_subscription(s).await
        }
        async fn update_subscription(&self, s: &Subscription) -> Result<bool, StorageError> {
            self.inner.update_subscription(s).await
        }
        async fn get_subscription(
            &self,
            id: SubscriptionId,
        ) -> Result<Option<Subscription>, StorageError> {
            self.inner.get_subscription(id).await
        }
        async fn list_subscriptions(&self) -> Result<Vec<Subscription>, StorageError> {
            self.inner.list_subscriptions().await
        }
        async fn delete_subscription(&self, id: SubscriptionId) -> Result<bool, StorageError> {
            self.inner.delete_subscription(id).await
        }
        async fn insert_event(&self, event: &DomainEvent) -> Result<(), StorageError> {
            self.inner.insert_event(event).await
        }
        async fn get_event(&self, id: EventId) -> Result<Option<DomainEvent>, StorageError> {
            self.inner.get_event(id).await
        }
        async fn insert_attempt(&self, attempt: &DeliveryAttempt) -> Result<(), StorageError> {
            if self.fail_insert_attempt {
                return Err(Self::refused());
            }
            self.inner.insert_attempt(attempt).await
        }
        async fn update_attempt(&self, attempt: &DeliveryAttempt) -> Result<(), StorageError> {
            self.inner.update_attempt(attempt).await
        }
        async fn get_attempt(
            &self,
            id: DeliveryId,
        ) -> Result<Option<DeliveryAttempt>, StorageError> {
            self.inner.get_attempt(id).await
        }
        async fn list_attempts(
            &self,
            subscription_id: Option<SubscriptionId>,
            limit: usize,
            offset: usize,
        ) -> Result<Vec<DeliveryAttempt>, StorageError> {
            self.inner.list_attempts(subscription_id, limit, offset).await
        }
        async fn record_chain(&self, state: &ChainState) -> Result<(), StorageError> {
            self.inner.record_chain(state).await
        }
        async fn load_chain(
            &self,
            subscription_id: SubscriptionId,
            event_id: EventId,
        ) -> Result<Option<ChainState>, StorageError> {
            self.inner.load_chain(subscription_id, event_id).await
        }
        async fn schedule(
            &self,
            task: &DeliveryTask,
            due_at: DateTime<Utc>,
        ) -> Result<(), StorageError> {
            if self.fail_schedule {
                return Err(Self::refused());
            }
            self.inner.schedule(task, due_at).await
        }
        async fn unschedule(&self, delivery_id: DeliveryId) -> Result<(), StorageError> {
            self.inner.unschedule(delivery_id).await
        }
        async fn is_scheduled(&self, delivery_id: DeliveryId) -> Result<bool, StorageError> {
            self.inner.is_scheduled(delivery_id).await
        }
        async fn load_due(
            &self,
            now: DateTime<Utc>,
            limit: usize,
        ) -> Result<Vec<DeliveryTask>, StorageError> {
            self.inner.load_due(now, limit).await
        }
        async fn next_due_at(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
            self.inner.next_due_at().await
        }
    }

    #[tokio::test]
    async fn unschedulable_chain_leaves_nothing_behind() {
        let storage = Arc::new(FailingWrites {
            fail_schedule: true,
            ..Default::default()
        });
        let sub = subscription(3, None);
        storage.insert_subscription(&sub).await.unwrap();

        let client = Arc::new(ScriptedClient::default());
        let mut dispatcher = Dispatcher::new(fast_config(), storage.clone(), client.clone());
        let event = event();
        let handles = dispatcher.fanout(&event).await.unwrap();
        assert!(handles.is_empty());

        sleep(Duration::from_millis(100)).await;
        dispatcher.shutdown().await;

        assert!(storage.list_attempts(None, 10, 0).await.unwrap().is_empty());
        assert!(storage.load_chain(sub.id, event.id).await.unwrap().is_none());
        assert!(client.requests.lock().unwrap().is_empty());
        assert_eq!(dispatcher.in_flight().await, 0);
    }

    #[tokio::test]
    async fn lost_ledger_write_still_delivers() {
        let storage = Arc::new(FailingWrites {
            fail_insert_attempt: true,
            ..Default::default()
        });
        let sub = subscription(3, None);
        storage.insert_subscription(&sub).await.unwrap();

        let client = Arc::new(ScriptedClient::default());
        let mut dispatcher = Dispatcher::new(fast_config(), storage.clone(), client.clone());
        let handles = dispatcher.fanout(&event()).await.unwrap();
        assert_eq!(handles.len(), 1);

        let state = wait_for_terminal(&storage.inner, &handles[0]).await;
        assert_eq!(state.status, ChainStatus::Success);
        dispatcher.shutdown().await;

        let row = storage.get_attempt(handles[0].delivery_id).await.unwrap().unwrap();
        assert_eq!(row.status, AttemptStatus::Success);
        assert_eq!(client.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn fanout_after_shutdown_is_rejected() {
        let storage = Arc::new(InMemoryStorage::new());
        let mut dispatcher =
            Dispatcher::new(fast_config(), storage, Arc::new(ScriptedClient::default()));
        dispatcher.shutdown().await;
        assert!(!dispatcher.is_running());

        let err = dispatcher.fanout(&event()).await.unwrap_err();
        assert!(matches!(err, WebhookError::Dispatch(DispatchError::Shutdown)));
    }
}
