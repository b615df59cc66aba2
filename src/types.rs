use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::WebhookError;

/// Default number of attempts per delivery chain.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// Default per-attempt timeout, in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

/// Wire marker for "every event type".
pub const WILDCARD: &str = "*";

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

uuid_id!(
    /// Identifier of a webhook subscription.
    SubscriptionId
);
uuid_id!(
    /// Identifier of a recorded domain event.
    EventId
);
uuid_id!(
    /// Identifier of a single delivery attempt. Sent as `X-Delivery-ID` so
    /// subscribers can drop re-executed attempts.
    DeliveryId
);

/// Closed vocabulary of domain events produced by the marketplace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "listing.created")]
    ListingCreated,
    #[serde(rename = "listing.updated")]
    ListingUpdated,
    #[serde(rename = "listing.deleted")]
    ListingDeleted,
    #[serde(rename = "order.created")]
    OrderCreated,
    #[serde(rename = "order.completed")]
    OrderCompleted,
    #[serde(rename = "order.cancelled")]
    OrderCancelled,
    #[serde(rename = "tender.created")]
    TenderCreated,
    #[serde(rename = "tender.updated")]
    TenderUpdated,
    #[serde(rename = "tender.closed")]
    TenderClosed,
    #[serde(rename = "tender.awarded")]
    TenderAwarded,
    #[serde(rename = "user.registered")]
    UserRegistered,
    #[serde(rename = "user.updated")]
    UserUpdated,
}

impl EventType {
    pub const ALL: [EventType; 12] = [
        EventType::ListingCreated,
        EventType::ListingUpdated,
        EventType::ListingDeleted,
        EventType::OrderCreated,
        EventType::OrderCompleted,
        EventType::OrderCancelled,
        EventType::TenderCreated,
        EventType::TenderUpdated,
        EventType::TenderClosed,
        EventType::TenderAwarded,
        EventType::UserRegistered,
        EventType::UserUpdated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ListingCreated => "listing.created",
            EventType::ListingUpdated => "listing.updated",
            EventType::ListingDeleted => "listing.deleted",
            EventType::OrderCreated => "order.created",
            EventType::OrderCompleted => "order.completed",
            EventType::OrderCancelled => "order.cancelled",
            EventType::TenderCreated => "tender.created",
            EventType::TenderUpdated => "tender.updated",
            EventType::TenderClosed => "tender.closed",
            EventType::TenderAwarded => "tender.awarded",
            EventType::UserRegistered => "user.registered",
            EventType::UserUpdated => "user.updated",
        }
    }

    /// Subscriber-facing description, shown in the event catalogue.
    pub fn description(&self) -> &'static str {
        match self {
            EventType::ListingCreated => "A new listing was created",
            EventType::ListingUpdated => "A listing's details or price changed",
            EventType::ListingDeleted => "A listing was removed",
            EventType::OrderCreated => "A buyer placed an order",
            EventType::OrderCompleted => "An order was fulfilled and closed",
            EventType::OrderCancelled => "An order was cancelled",
            EventType::TenderCreated => "A new tender was opened",
            EventType::TenderUpdated => "A tender's terms changed",
            EventType::TenderClosed => "A tender stopped accepting bids",
            EventType::TenderAwarded => "A tender was awarded to a bidder",
            EventType::UserRegistered => "A new user account was registered",
            EventType::UserUpdated => "A user's profile changed",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = WebhookError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| WebhookError::Validation(format!("unknown event type: {s}")))
    }
}

/// Which events a subscription wants to receive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "EventSelector", into = "EventSelector")]
pub enum Interest {
    /// Every event type (`"*"` on the wire).
    All,
    /// An explicit, non-empty list.
    Only(Vec<EventType>),
}

impl Interest {
    pub fn matches(&self, event_type: EventType) -> bool {
        match self {
            Interest::All => true,
            Interest::Only(types) => types.contains(&event_type),
        }
    }
}

/// Unvalidated wire form of an [`Interest`]: either `"*"` or a list of
/// event type names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventSelector {
    Wildcard(String),
    List(Vec<String>),
}

impl TryFrom<EventSelector> for Interest {
    type Error = WebhookError;

    fn try_from(selector: EventSelector) -> Result<Self, Self::Error> {
        match selector {
            EventSelector::Wildcard(marker) if marker == WILDCARD => Ok(Interest::All),
            EventSelector::Wildcard(other) => Err(WebhookError::Validation(format!(
                "events must be \"{WILDCARD}\" or a list of event types, got \"{other}\""
            ))),
            EventSelector::List(names) if names.is_empty() => Err(WebhookError::Validation(
                "events must not be empty".to_string(),
            )),
            EventSelector::List(names) => {
                if names.iter().any(|n| n == WILDCARD) {
                    return Ok(Interest::All);
                }
                let mut types = Vec::with_capacity(names.len());
                for name in names {
                    let event_type = name.parse::<EventType>()?;
                    if !types.contains(&event_type) {
                        types.push(event_type);
                    }
                }
                Ok(Interest::Only(types))
            }
        }
    }
}

impl From<Interest> for EventSelector {
    fn from(interest: Interest) -> Self {
        match interest {
            Interest::All => EventSelector::Wildcard(WILDCARD.to_string()),
            Interest::Only(types) => {
                EventSelector::List(types.iter().map(|t| t.as_str().to_string()).collect())
            }
        }
    }
}

impl From<Vec<EventType>> for EventSelector {
    fn from(types: Vec<EventType>) -> Self {
        EventSelector::from(Interest::Only(types))
    }
}

/// A registered webhook endpoint and its delivery settings.
///
/// This is the stored form and includes the secret; API responses go
/// through [`SubscriptionView`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub url: String,
    pub interest: Interest,
    pub name: Option<String>,
    pub description: Option<String>,
    pub active: bool,
    pub secret: Option<String>,
    /// Maximum number of attempts per delivery chain, initial attempt included.
    pub retry_attempts: u32,
    pub timeout_seconds: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn wants(&self, event_type: EventType) -> bool {
        self.active && self.interest.matches(event_type)
    }
}

/// Request to register a subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSubscription {
    pub url: String,
    pub events: EventSelector,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub retry_attempts: Option<u32>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl NewSubscription {
    pub fn new(url: impl Into<String>, events: impl Into<EventSelector>) -> Self {
        Self {
            url: url.into(),
            events: events.into(),
            name: None,
            description: None,
            active: None,
            secret: None,
            retry_attempts: None,
            timeout_seconds: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn with_retry_attempts(mut self, retry_attempts: u32) -> Self {
        self.retry_attempts = Some(retry_attempts);
        self
    }

    pub fn with_timeout_seconds(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = Some(timeout_seconds);
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = Some(false);
        self
    }
}

/// Partial update of a subscription. Absent fields are left untouched.
///
/// An empty `secret` string removes the secret.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionPatch {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub events: Option<EventSelector>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub retry_attempts: Option<u32>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// Subscription as shown to API callers; the secret never leaves the service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionView {
    pub id: SubscriptionId,
    pub url: String,
    pub events: EventSelector,
    pub name: Option<String>,
    pub description: Option<String>,
    pub active: bool,
    pub has_secret: bool,
    pub retry_attempts: u32,
    pub timeout_seconds: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Subscription> for SubscriptionView {
    fn from(sub: &Subscription) -> Self {
        Self {
            id: sub.id,
            url: sub.url.clone(),
            events: sub.interest.clone().into(),
            name: sub.name.clone(),
            description: sub.description.clone(),
            active: sub.active,
            has_secret: sub.secret.is_some(),
            retry_attempts: sub.retry_attempts,
            timeout_seconds: sub.timeout_seconds,
            created_at: sub.created_at,
            updated_at: sub.updated_at,
        }
    }
}

/// A recorded domain event. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub id: EventId,
    pub event_type: EventType,
    pub data: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

/// Status of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Pending,
    Success,
    Failed,
}

/// One row of the delivery ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub id: DeliveryId,
    pub subscription_id: SubscriptionId,
    pub event_id: EventId,
    pub event_type: EventType,
    pub attempt_number: u32,
    pub status: AttemptStatus,
    pub response_status: Option<u16>,
    pub response_body: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// When a pending retry becomes due. `None` for first attempts.
    pub next_attempt_at: Option<DateTime<Utc>>,
}

/// Lifecycle of a delivery chain (one event to one subscription).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    Pending,
    FailedRetrying,
    Success,
    FailedExhausted,
}

impl ChainStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChainStatus::Success | ChainStatus::FailedExhausted)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainState {
    pub subscription_id: SubscriptionId,
    pub event_id: EventId,
    pub status: ChainStatus,
    /// Attempts completed so far.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Returned by fan-out: one per started delivery chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryChainHandle {
    pub subscription_id: SubscriptionId,
    pub event_id: EventId,
    /// Id of attempt #1.
    pub delivery_id: DeliveryId,
}

/// Entry of the event catalogue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTypeInfo {
    pub event: EventType,
    pub description: String,
}
