//! HTTP management surface.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::error::{ApiResult, WebhookError};
use crate::ledger::event_catalogue;
use crate::service::WebhookService;
use crate::types::{
    DeliveryAttempt, DeliveryChainHandle, DomainEvent, EventType, EventTypeInfo, NewSubscription,
    SubscriptionId, SubscriptionPatch, SubscriptionView,
};

pub type AppState = Arc<WebhookService>;

#[derive(Debug, Deserialize)]
pub struct DeliveriesQuery {
    pub subscription_id: Option<SubscriptionId>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeletedResponse {
    pub deleted: bool,
}

#[derive(Debug, Deserialize)]
pub struct TriggerRequest {
    pub event_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TriggerResponse {
    pub event: DomainEvent,
    pub deliveries: Vec<DeliveryChainHandle>,
}

pub fn router(service: AppState) -> Router {
    Router::new()
        .route("/webhooks", post(create_subscription).get(list_subscriptions))
        .route("/webhooks/deliveries", get(list_deliveries))
        .route("/webhooks/events", get(list_event_types))
        .route(
            "/webhooks/{id}",
            get(get_subscription)
                .patch(update_subscription)
                .delete(delete_subscription),
        )
        .route("/events", post(trigger_event))
        .with_state(service)
}

async fn create_subscription(
    State(service): State<AppState>,
    Json(request): Json<NewSubscription>,
) -> ApiResult<(StatusCode, Json<SubscriptionView>)> {
    let subscription = service.registry().register(request).await?;
    Ok((StatusCode::CREATED, Json(SubscriptionView::from(&subscription))))
}

async fn list_subscriptions(
    State(service): State<AppState>,
) -> ApiResult<Json<Vec<SubscriptionView>>> {
    let subscriptions = service.registry().list().await?;
    Ok(Json(subscriptions.iter().map(SubscriptionView::from).collect()))
}

async fn get_subscription(
    State(service): State<AppState>,
    Path(id): Path<SubscriptionId>,
) -> ApiResult<Json<SubscriptionView>> {
    let subscription = service.registry().get(id).await?;
    Ok(Json(SubscriptionView::from(&subscription)))
}

async fn update_subscription(
    State(service): State<AppState>,
    Path(id): Path<SubscriptionId>,
    Json(patch): Json<SubscriptionPatch>,
) -> ApiResult<Json<SubscriptionView>> {
    let subscription = service.registry().update(id, patch).await?;
    Ok(Json(SubscriptionView::from(&subscription)))
}

async fn delete_subscription(
    State(service): State<AppState>,
    Path(id): Path<SubscriptionId>,
) -> ApiResult<Json<DeletedResponse>> {
    if service.registry().delete(id).await? {
        Ok(Json(DeletedResponse { deleted: true }))
    } else {
        Err(WebhookError::SubscriptionNotFound(id))
    }
}

async fn list_deliveries(
    State(service): State<AppState>,
    Query(query): Query<DeliveriesQuery>,
) -> ApiResult<Json<Vec<DeliveryAttempt>>> {
    let attempts = service
        .ledger()
        .list_deliveries(query.subscription_id, query.limit, query.offset)
        .await?;
    Ok(Json(attempts))
}

async fn list_event_types() -> Json<Vec<EventTypeInfo>> {
    Json(event_catalogue())
}

/// Producer-side entry point: record an event and start its deliveries.
async fn trigger_event(
    State(service): State<AppState>,
    Json(request): Json<TriggerRequest>,
) -> ApiResult<(StatusCode, Json<TriggerResponse>)> {
    let event_type: EventType = request.event_type.parse()?;
    let (event, deliveries) = service.trigger(event_type, request.data).await?;
    Ok((StatusCode::ACCEPTED, Json(TriggerResponse { event, deliveries })))
}
