use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use ordercore::config::MaxRetryAttempts;
use ordercore::{OrderCore, OrderCoreConfig, RetryPolicy};
use ordercore_api::router;
use ordercore_memory::{InMemoryHistoryStore, InMemoryOrderStore, InMemoryWorkQueue};
use ordercore_testing::{fixtures, ChaosConfig, ChaosWorkQueue, ChaosWorkQueueExt, FixedClock};
use serde_json::{json, Value};
use tower::ServiceExt;

type Core<Q> = OrderCore<InMemoryOrderStore, Q, InMemoryHistoryStore>;

fn config() -> OrderCoreConfig {
    OrderCoreConfig {
        retry: RetryPolicy::fast(MaxRetryAttempts::try_new(2).unwrap()),
        ..OrderCoreConfig::default()
    }
}

fn core() -> Core<InMemoryWorkQueue> {
    OrderCore::new(
        &config(),
        Arc::new(InMemoryOrderStore::new()),
        Arc::new(InMemoryWorkQueue::new()),
        Arc::new(InMemoryHistoryStore::new()),
        Arc::new(FixedClock::default()),
    )
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn post_order(body: &str) -> Request<Body> {
    Request::post("/api/orders")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn submit_returns_accepted_then_ok_for_the_same_order() {
    // Given: a fresh server
    let app = router(core());
    let body = fixtures::sample_request_body("ORD-1").to_string();

    // When: the same order is posted twice
    let (first_status, first) = send(&app, post_order(&body)).await;
    let (second_status, second) = send(&app, post_order(&body)).await;

    // Then: 202 the first time, 200 afterwards, same body shape
    assert_eq!(first_status, StatusCode::ACCEPTED);
    assert_eq!(first, json!({ "orderId": "ORD-1", "orderStatus": "CREATED" }));
    assert_eq!(second_status, StatusCode::OK);
    assert_eq!(second["orderId"], "ORD-1");
}

#[tokio::test]
async fn invalid_submissions_are_rejected_with_400() {
    let app = router(core());

    let (status, body) = send(&app, post_order("{not json")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]
        .as_str()
        .unwrap()
        .starts_with("Invalid JSON payload"));

    let (status, body) = send(
        &app,
        post_order(r#"{"orderId":"ORD-2","customerId":"CUST-1","items":[]}"#),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Items list cannot be empty");

    let (status, body) = send(
        &app,
        post_order(
            r#"{"orderId":"ORD-3","customerId":"CUST-1","items":[{"sku":"A","qty":0,"price":1}]}"#,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["violations"][0]["field"], "items[0].qty");

    // Nothing was stored for any of them
    let (status, _) = send(&app, get("/api/orders/ORD-3")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn order_status_shows_totals_as_numbers_after_processing() {
    // Given: a submitted order
    let core = core();
    let app = router(core.clone());
    send(
        &app,
        post_order(&fixtures::sample_request_body("ORD-1").to_string()),
    )
    .await;

    // Then: before dispatch the totals are null
    let (status, before) = send(&app, get("/api/orders/ORD-1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(before["orderStatus"], "CREATED");
    assert!(before["totals"].is_null());

    // When: the worker processes the order
    core.worker().drain().await.unwrap();

    // Then: the totals are rendered as JSON numbers
    let (_, after) = send(&app, get("/api/orders/ORD-1")).await;
    assert_eq!(
        after,
        json!({
            "orderId": "ORD-1",
            "orderStatus": "COMPLETED",
            "totals": { "subtotal": 25.0, "tax": 4.75, "discount": 0.0, "total": 29.75 }
        })
    );
}

#[tokio::test]
async fn instance_status_is_404_until_dispatch_then_completed() {
    let core = core();
    let app = router(core.clone());
    send(
        &app,
        post_order(&fixtures::sample_request_body("ORD-1").to_string()),
    )
    .await;

    let (status, body) = send(&app, get("/api/orders/ORD-1/status")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Orchestration instance not found");

    core.worker().drain().await.unwrap();

    let (status, body) = send(&app, get("/api/orders/ORD-1/status")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["instanceId"], "ORD-1");
    assert_eq!(body["runtimeStatus"], "Completed");
    assert_eq!(body["currentStep"], "publish_outcome");
    assert_eq!(body["output"], "Order processed successfully.");
}

#[tokio::test]
async fn unknown_order_is_404() {
    let app = router(core());

    let (status, body) = send(&app, get("/api/orders/ORD-NOPE")).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Order not found");
}

#[tokio::test]
async fn dispatch_outage_is_503_and_resubmission_dispatches_once() {
    // Given: a dispatch queue that is down for one full retry budget
    let config = config();
    let queue = Arc::new(InMemoryWorkQueue::new().with_chaos(ChaosConfig::deterministic()));
    queue.fail_next_publishes(&config.queues.to_process, 2);
    let core: Core<ChaosWorkQueue<InMemoryWorkQueue>> = OrderCore::new(
        &config,
        Arc::new(InMemoryOrderStore::new()),
        Arc::clone(&queue),
        Arc::new(InMemoryHistoryStore::new()),
        Arc::new(FixedClock::default()),
    );
    let app = router(core);
    let body = fixtures::sample_request_body("ORD-1").to_string();

    // When: the order is submitted
    let (status, _) = send(&app, post_order(&body)).await;

    // Then: the client is told to retry, and a retry sees the stored order
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(queue.inner().published(&config.queues.to_process).is_empty());
    let (status, again) = send(&app, post_order(&body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again["orderStatus"], "CREATED");

    // And: the retry dispatched the order exactly once
    send(&app, post_order(&body)).await;
    assert_eq!(queue.inner().published(&config.queues.to_process).len(), 1);
}
