//! Marketplace webhook delivery engine.
//!
//! Subscribers register a callback URL and the event types they care
//! about. Every domain event is recorded once, fanned out to the matching
//! active subscriptions, and delivered by a fixed worker pool. Failed
//! attempts are retried with exponential backoff up to each
//! subscription's ceiling; every attempt lands in a queryable ledger.
//!
//! ## Guarantees
//! - Bounded resource usage: a fixed worker pool behind a bounded queue
//! - Fan-out never waits on delivery
//! - Retries survive restarts (next-attempt markers are persisted)
//! - At-least-once delivery; subscribers dedupe on `X-Delivery-ID`
//! - Exhausted chains stay visible as `failed_exhausted`
//!
//! ## Non-Guarantees
//! - Exactly-once delivery
//! - Ordering between chains
//! - Cancelling attempts that are already scheduled

mod api;
mod client;
mod config;
mod dispatcher;
mod error;
mod ledger;
mod recorder;
mod registry;
mod retry;
mod service;
mod signing;
mod storage;
mod types;
mod worker;

#[cfg(feature = "postgres")]
mod storage_postgres;

pub use api::{router, AppState, DeletedResponse, DeliveriesQuery, TriggerRequest, TriggerResponse};
pub use client::{HttpResponse, OutboundRequest, ReqwestClient, WebhookClient, MAX_READ_BYTES};
pub use config::Settings;
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use error::{
    ApiResult, DeliveryOutcome, DispatchError, ErrorResponse, FailureReason, StorageError,
    WebhookError,
};
pub use ledger::{event_catalogue, Ledger, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
pub use recorder::EventRecorder;
pub use registry::{Registry, MAX_RETRY_ATTEMPTS, MAX_TIMEOUT_SECONDS};
pub use retry::RetryPolicy;
pub use service::WebhookService;
pub use signing::{
    build_signature_headers, compute_signature, is_timestamp_fresh, verify_signature,
    verify_webhook_request, SignatureHeaders, VerificationError, SIGNATURE_HEADER,
    TIMESTAMP_HEADER,
};
pub use storage::{InMemoryStorage, Storage};
pub use types::{
    AttemptStatus, ChainState, ChainStatus, DeliveryAttempt, DeliveryChainHandle, DeliveryId,
    DomainEvent, EventId, EventSelector, EventType, EventTypeInfo, Interest, NewSubscription,
    Subscription, SubscriptionId, SubscriptionPatch, SubscriptionView, DEFAULT_RETRY_ATTEMPTS,
    DEFAULT_TIMEOUT_SECONDS, WILDCARD,
};
pub use worker::{DeliveryTask, Envelope, MAX_RESPONSE_BODY_CHARS, USER_AGENT};

#[cfg(feature = "postgres")]
pub use storage_postgres::PostgresStorage;
