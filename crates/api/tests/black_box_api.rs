use std::sync::Arc;

use reqwest::StatusCode;
use serde_json::{json, Value};

use orderflow_events::InMemoryBroker;
use orderflow_infra::{AppConfig, InMemoryOrderStore};

struct TestServer {
    base_url: String,
    store: Arc<InMemoryOrderStore>,
    broker: Arc<InMemoryBroker>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        Self::spawn_with_routes(axum::Router::new()).await
    }

    /// Same router and middleware as prod plus `extra` routes, in-memory
    /// adapters, ephemeral port.
    async fn spawn_with_routes(extra: axum::Router) -> Self {
        let config = AppConfig::from_lookup(|_| None).expect("default config");
        let store = Arc::new(InMemoryOrderStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let runtime = orderflow_api::app::services::build_in_memory_services(&config, store.clone(), broker.clone());
        let app = orderflow_api::with_middleware(
            orderflow_api::app::routes::router().merge(extra),
            runtime.services.clone(),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
            drop(runtime);
        });

        Self {
            base_url,
            store,
            broker,
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn create(client: &reqwest::Client, srv: &TestServer, body: Value) -> reqwest::Response {
    client.post(srv.url("/orders")).json(&body).send().await.unwrap()
}

#[tokio::test]
async fn create_then_get_returns_identical_order() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = create(
        &client,
        &srv,
        json!({"customerId": 42, "items": [{"productId": 1, "quantity": 2, "price": 9.99}]}),
    )
    .await;
    assert_eq!(res.status(), StatusCode::CREATED);
    let created: Value = res.json().await.unwrap();

    assert!(created["id"].as_i64().unwrap() > 0);
    assert_eq!(created["customerId"], 42);
    assert_eq!(created["total"], 19.98);
    assert_eq!(created["status"], "CREATED");
    assert_eq!(created["items"][0]["productId"], 1);
    assert_eq!(created["items"][0]["price"], 9.99);
    assert!(created["createdAt"].is_string());

    let res = client
        .get(srv.url(&format!("/orders/get?id={}", created["id"])))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let fetched: Value = res.json().await.unwrap();
    assert_eq!(fetched, created);
}

#[tokio::test]
async fn created_order_is_published_keyed_by_id() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let created: Value = create(
        &client,
        &srv,
        json!({"customer_id": 7, "items": [{"product_id": 3, "quantity": 1, "price": 5}]}),
    )
    .await
    .json()
    .await
    .unwrap();

    let messages = srv.broker.messages("orders");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].key.as_deref(), Some(created["id"].to_string().as_str()));
    let payload: Value = serde_json::from_slice(&messages[0].payload).unwrap();
    assert_eq!(payload["total"], created["total"]);
}

#[tokio::test]
async fn unknown_order_is_404() {
    let srv = TestServer::spawn().await;

    let res = reqwest::get(srv.url("/orders/get?id=999999")).await.unwrap();

    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["code"], "not_found");
}

#[tokio::test]
async fn malformed_or_missing_id_is_400() {
    let srv = TestServer::spawn().await;

    for path in ["/orders/get?id=abc", "/orders/get?id=-4", "/orders/get?id=0", "/orders/get"] {
        let res = reqwest::get(srv.url(path)).await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST, "{path}");
    }
}

#[tokio::test]
async fn missing_items_is_rejected_without_side_effects() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = create(&client, &srv, json!({"customerId": 42})).await;

    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["code"], "validation_error");
    assert!(body["details"].as_array().unwrap().iter().any(|d| d["field"] == "items"));
    assert!(srv.store.is_empty());
    assert!(srv.broker.messages("orders").is_empty());
}

#[tokio::test]
async fn every_invalid_item_field_is_reported() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = create(
        &client,
        &srv,
        json!({"customerId": 42, "items": [
            {"productId": 1, "quantity": -1, "price": 1.00},
            {"productId": 2, "quantity": 1, "price": -3.50}
        ]}),
    )
    .await;

    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    let fields: Vec<&str> = body["details"]
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["field"].as_str().unwrap())
        .collect();
    assert!(fields.contains(&"items[0].quantity"));
    assert!(fields.contains(&"items[1].price"));
}

#[tokio::test]
async fn malformed_json_is_400() {
    let srv = TestServer::spawn().await;

    let res = reqwest::Client::new()
        .post(srv.url("/orders"))
        .header("content-type", "application/json")
        .body("{\"customerId\": 42, \"items\": [")
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["code"], "malformed_body");
}

#[tokio::test]
async fn client_total_is_ignored() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let created: Value = create(
        &client,
        &srv,
        json!({"customerId": 1, "total": 0.01, "items": [{"productId": 1, "quantity": 3, "price": 2.5}]}),
    )
    .await
    .json()
    .await
    .unwrap();

    assert_eq!(created["total"], 7.5);
}

#[tokio::test]
async fn idempotency_key_replays_the_same_order() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let body = json!({"customerId": 42, "items": [{"productId": 1, "quantity": 2, "price": 9.99}]});

    let mut ids = Vec::new();
    for _ in 0..2 {
        let res = client
            .post(srv.url("/orders"))
            .header("Idempotency-Key", "checkout-abc")
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
        let created: Value = res.json().await.unwrap();
        ids.push(created["id"].clone());
    }

    assert_eq!(ids[0], ids[1]);
    assert_eq!(srv.store.len(), 1);
    assert_eq!(srv.broker.messages("orders").len(), 1);
}

#[tokio::test]
async fn storage_outage_is_500_with_generic_message() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    srv.store.set_available(false);

    let res = create(
        &client,
        &srv,
        json!({"customerId": 42, "items": [{"productId": 1, "quantity": 1, "price": 1}]}),
    )
    .await;
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "failed to save order");

    let res = reqwest::get(srv.url("/orders/get?id=1")).await.unwrap();
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(srv.broker.messages("orders").is_empty());
}

#[tokio::test]
async fn health_and_stats() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = reqwest::get(srv.url("/health")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    create(
        &client,
        &srv,
        json!({"customerId": 42, "items": [{"productId": 1, "quantity": 1, "price": 1}]}),
    )
    .await;

    let stats: Value = reqwest::get(srv.url("/stats")).await.unwrap().json().await.unwrap();
    assert_eq!(stats["backend"], "in_memory");
    assert_eq!(stats["orders"]["orders_created"], 1);
    assert_eq!(stats["publisher"]["published"], 1);
}

#[tokio::test]
async fn wrong_method_is_rejected() {
    let srv = TestServer::spawn().await;

    let res = reqwest::get(srv.url("/orders")).await.unwrap();

    assert_eq!(res.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn handler_panic_becomes_json_500_and_server_keeps_serving() {
    async fn explode() -> &'static str {
        panic!("handler exploded")
    }

    let srv = TestServer::spawn_with_routes(axum::Router::new().route("/explode", axum::routing::get(explode))).await;
    let client = reqwest::Client::new();

    let res = client.get(srv.url("/explode")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["code"], "internal_error");
    assert_eq!(body["error"], "internal server error");
    assert!(!body.to_string().contains("exploded"));

    let res = client.get(srv.url("/health")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = create(
        &client,
        &srv,
        json!({"customerId": 1, "items": [{"productId": 1, "quantity": 1, "price": 1.0}]}),
    )
    .await;
    assert_eq!(res.status(), StatusCode::CREATED);
}
