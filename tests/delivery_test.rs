use std::sync::Arc;
use std::time::Duration;

use marketplace_webhooks::{
    verify_webhook_request, AttemptStatus, ChainState, ChainStatus, DeliveryChainHandle,
    DispatcherConfig, EventType, InMemoryStorage, Interest, NewSubscription, ReqwestClient,
    RetryPolicy, WebhookService, MAX_RESPONSE_BODY_CHARS, USER_AGENT,
};
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn service() -> WebhookService {
    let config = DispatcherConfig {
        worker_count: 4,
        queue_size: 32,
        poll_interval: Duration::from_millis(10),
        scheduler_batch: 64,
        retry: RetryPolicy::new(Duration::from_millis(20), Duration::from_millis(200)),
    };
    WebhookService::new(
        Arc::new(InMemoryStorage::new()),
        Arc::new(ReqwestClient::new()),
        config,
    )
}

async fn wait_for_terminal(service: &WebhookService, chain: &DeliveryChainHandle) -> ChainState {
    for _ in 0..600 {
        if let Ok(state) = service
            .ledger()
            .chain_state(chain.subscription_id, chain.event_id)
            .await
        {
            if state.status.is_terminal() {
                return state;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("delivery chain did not reach a terminal state");
}

async fn hook_server(status: u16) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(status))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn listing_event_reaches_interested_subscriber() {
    let server = hook_server(200).await;
    let service = service();
    let sub = service
        .registry()
        .register(NewSubscription::new(
            format!("{}/hook", server.uri()),
            vec![EventType::ListingCreated],
        ))
        .await
        .unwrap();

    let (event, chains) = service
        .trigger(EventType::ListingCreated, json!({ "id": "abc" }))
        .await
        .unwrap();
    assert_eq!(chains.len(), 1);
    assert_eq!(chains[0].subscription_id, sub.id);
    assert_eq!(wait_for_terminal(&service, &chains[0]).await.status, ChainStatus::Success);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    let body: Value = serde_json::from_slice(&request.body).unwrap();
    assert_eq!(body["data"]["id"], "abc");
    assert_eq!(body["event_id"], event.id.to_string());
    assert_eq!(body["event_type"], "listing.created");
    assert!(body["timestamp"].is_string());

    let header = |name: &str| request.headers.get(name).and_then(|v| v.to_str().ok());
    assert_eq!(header("content-type"), Some("application/json"));
    assert_eq!(header("user-agent"), Some(USER_AGENT));
    assert_eq!(header("x-webhook-id"), Some(sub.id.to_string().as_str()));
    assert_eq!(header("x-event-type"), Some("listing.created"));
    assert_eq!(
        header("x-delivery-id"),
        Some(chains[0].delivery_id.to_string().as_str())
    );
    assert!(header("x-webhook-signature").is_none());

    // Other event types never reach this subscriber.
    let (_, chains) = service
        .trigger(EventType::OrderCreated, json!({}))
        .await
        .unwrap();
    assert!(chains.is_empty());
    service.shutdown().await;
}

#[tokio::test]
async fn signed_delivery_verifies_without_sending_the_secret() {
    let server = hook_server(204).await;
    let service = service();
    service
        .registry()
        .register(
            NewSubscription::new(format!("{}/hook", server.uri()), vec![EventType::TenderAwarded])
                .with_secret("whsec_tender"),
        )
        .await
        .unwrap();

    let (_, chains) = service
        .trigger(EventType::TenderAwarded, json!({ "tender": 42 }))
        .await
        .unwrap();
    assert_eq!(wait_for_terminal(&service, &chains[0]).await.status, ChainStatus::Success);

    let requests = server.received_requests().await.unwrap();
    let request = &requests[0];
    let headers: Vec<(&str, &str)> = request
        .headers
        .iter()
        .filter_map(|(k, v)| Some((k.as_str(), v.to_str().ok()?)))
        .collect();
    assert!(headers.iter().all(|(_, v)| !v.contains("whsec_tender")));

    let now = chrono::Utc::now().timestamp();
    verify_webhook_request(headers, &request.body, b"whsec_tender", 300, now).unwrap();
    service.shutdown().await;
}

#[tokio::test]
async fn failing_subscriber_exhausts_after_ceiling() {
    let server = hook_server(500).await;
    let service = service();
    let sub = service
        .registry()
        .register(
            NewSubscription::new(format!("{}/hook", server.uri()), vec![EventType::OrderCreated])
                .with_retry_attempts(3),
        )
        .await
        .unwrap();

    let (_, chains) = service
        .trigger(EventType::OrderCreated, json!({ "order": 1 }))
        .await
        .unwrap();
    let state = wait_for_terminal(&service, &chains[0]).await;
    assert_eq!(state.status, ChainStatus::FailedExhausted);
    assert_eq!(state.attempts, 3);
    assert_eq!(state.last_error.as_deref(), Some("HTTP 500"));

    // Longer than the largest backoff: a fourth attempt would have shown up.
    tokio::time::sleep(Duration::from_millis(400)).await;

    let mut rows = service
        .ledger()
        .list_deliveries(Some(sub.id), None, None)
        .await
        .unwrap();
    rows.sort_by_key(|r| r.attempt_number);
    assert_eq!(rows.iter().map(|r| r.attempt_number).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert!(rows.iter().all(|r| r.status == AttemptStatus::Failed));
    assert!(rows.iter().all(|r| r.response_status == Some(500)));
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
    service.shutdown().await;
}

#[tokio::test]
async fn timeout_then_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let service = service();
    let sub = service
        .registry()
        .register(
            NewSubscription::new(format!("{}/hook", server.uri()), vec![EventType::UserRegistered])
                .with_timeout_seconds(1),
        )
        .await
        .unwrap();

    let (_, chains) = service
        .trigger(EventType::UserRegistered, json!({ "user": "u-1" }))
        .await
        .unwrap();
    let state = wait_for_terminal(&service, &chains[0]).await;
    assert_eq!(state.status, ChainStatus::Success);
    assert_eq!(state.attempts, 2);

    let mut rows = service
        .ledger()
        .list_deliveries(Some(sub.id), None, None)
        .await
        .unwrap();
    rows.sort_by_key(|r| r.attempt_number);
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].status, AttemptStatus::Failed);
    assert_eq!(rows[0].error.as_deref(), Some("request timed out"));
    assert_eq!(rows[0].response_status, None);
    assert_eq!(rows[1].status, AttemptStatus::Success);
    assert_eq!(rows[1].response_status, Some(200));
    service.shutdown().await;
}

#[tokio::test]
async fn chains_for_one_event_progress_independently() {
    let healthy = hook_server(200).await;
    let broken = hook_server(503).await;
    let service = service();

    let ok_sub = service
        .registry()
        .register(NewSubscription::new(
            format!("{}/hook", healthy.uri()),
            vec![EventType::OrderCompleted],
        ))
        .await
        .unwrap();
    let bad_sub = service
        .registry()
        .register(
            NewSubscription::new(format!("{}/hook", broken.uri()), vec![EventType::OrderCompleted])
                .with_retry_attempts(2),
        )
        .await
        .unwrap();

    let (_, chains) = service
        .trigger(EventType::OrderCompleted, json!({ "order": 77 }))
        .await
        .unwrap();
    assert_eq!(chains.len(), 2);

    for chain in &chains {
        let state = wait_for_terminal(&service, chain).await;
        if chain.subscription_id == ok_sub.id {
            assert_eq!(state.status, ChainStatus::Success);
            assert_eq!(state.attempts, 1);
        } else {
            assert_eq!(chain.subscription_id, bad_sub.id);
            assert_eq!(state.status, ChainStatus::FailedExhausted);
            assert_eq!(state.attempts, 2);
        }
    }

    assert_eq!(healthy.received_requests().await.unwrap().len(), 1);
    assert_eq!(broken.received_requests().await.unwrap().len(), 2);
    service.shutdown().await;
}

#[tokio::test]
async fn deleting_subscription_keeps_history_and_running_chain() {
    let server = hook_server(500).await;
    let service = service();
    let sub = service
        .registry()
        .register(
            NewSubscription::new(format!("{}/hook", server.uri()), Interest::All)
                .with_retry_attempts(3),
        )
        .await
        .unwrap();

    let (_, chains) = service
        .trigger(EventType::ListingDeleted, json!({ "id": "gone" }))
        .await
        .unwrap();
    assert!(service.registry().delete(sub.id).await.unwrap());

    let state = wait_for_terminal(&service, &chains[0]).await;
    assert_eq!(state.status, ChainStatus::FailedExhausted);
    let rows = service
        .ledger()
        .list_deliveries(Some(sub.id), None, None)
        .await
        .unwrap();
    assert_eq!(rows.len(), 3);

    // No new chains once deleted.
    let (_, chains) = service
        .trigger(EventType::ListingDeleted, json!({}))
        .await
        .unwrap();
    assert!(chains.is_empty());
    service.shutdown().await;
}

#[tokio::test]
async fn huge_subscriber_body_is_stored_truncated() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200).set_body_string("y".repeat(1024 * 1024)))
        .mount(&server)
        .await;

    let service = service();
    let sub = service
        .registry()
        .register(NewSubscription::new(format!("{}/hook", server.uri()), Interest::All))
        .await
        .unwrap();

    let (_, chains) = service
        .trigger(EventType::ListingUpdated, json!({ "id": "big" }))
        .await
        .unwrap();
    assert_eq!(wait_for_terminal(&service, &chains[0]).await.status, ChainStatus::Success);

    let rows = service
        .ledger()
        .list_deliveries(Some(sub.id), None, None)
        .await
        .unwrap();
    let body = rows[0].response_body.as_deref().unwrap();
    assert_eq!(body.chars().count(), MAX_RESPONSE_BODY_CHARS);
    service.shutdown().await;
}
