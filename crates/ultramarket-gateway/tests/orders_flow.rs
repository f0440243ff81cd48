//! End-to-end tests for authenticated order traffic through the gateway.

mod common;

use common::fixtures::{platform_config, TokenBuilder};
use common::{TestBackend, TestGateway};
use futures::stream::{self, StreamExt};
use reqwest::StatusCode;
use ultramarket_gateway::auth::Role;

const NO_BURST: &str = r#"
[rate_limit.burst]
enabled = false
"#;

#[tokio::test]
async fn valid_token_is_forwarded_with_identity() {
    let backend = TestBackend::spawn().await;
    let gateway = TestGateway::start(&platform_config(&backend.addr.to_string(), NO_BURST)).await;
    let token = TokenBuilder::new("cust-1001").build();

    let response = gateway
        .get_as("/api/v1/orders/555?expand=items", &token)
        .header("x-correlation-id", "checkout-abc")
        .header("x-user-id", "someone-else")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-correlation-id"], "checkout-abc");
    assert_eq!(response.headers()["x-ratelimit-limit"], "2000");
    assert_eq!(response.headers()["x-ratelimit-remaining"], "1999");

    let echoed: serde_json::Value = response.json().await.unwrap();
    assert_eq!(echoed["path"], "/api/v1/orders/555");
    assert_eq!(echoed["query"], "expand=items");
    assert_eq!(echoed["headers"]["x-user-id"], "cust-1001");
    assert_eq!(echoed["headers"]["x-user-role"], "customer");
    assert_eq!(echoed["headers"]["x-correlation-id"], "checkout-abc");
    assert_eq!(echoed["headers"]["x-gateway-service"], "orders");
    assert_eq!(echoed["headers"]["x-forwarded-for"], "127.0.0.1");
    assert_eq!(backend.hits(), 1);

    gateway.shutdown().await;
}

#[tokio::test]
async fn correlation_id_is_generated_when_absent() {
    let backend = TestBackend::spawn().await;
    let gateway = TestGateway::start(&platform_config(&backend.addr.to_string(), "")).await;

    let response = gateway.get("/api/v1/products/9").send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let returned = response.headers()["x-correlation-id"]
        .to_str()
        .unwrap()
        .to_string();
    let echoed: serde_json::Value = response.json().await.unwrap();
    assert_eq!(echoed["headers"]["x-correlation-id"], returned.as_str());
    assert!(echoed["headers"].get("x-user-id").is_none());
}

#[tokio::test]
async fn expired_token_never_reaches_backend() {
    let backend = TestBackend::spawn().await;
    let gateway = TestGateway::start(&platform_config(&backend.addr.to_string(), "")).await;
    let token = TokenBuilder::new("cust-1001").expired().build();

    let response = gateway
        .get_as("/api/v1/orders", &token)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().contains_key("www-authenticate"));
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "expired");
    assert_eq!(backend.hits(), 0);
}

#[tokio::test]
async fn missing_and_malformed_credentials() {
    let backend = TestBackend::spawn().await;
    let gateway = TestGateway::start(&platform_config(&backend.addr.to_string(), "")).await;

    let missing = gateway.get("/api/v1/orders").send().await.unwrap();
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = missing.json().await.unwrap();
    assert_eq!(body["code"], "missing");

    let wrong_scheme = gateway
        .get("/api/v1/orders")
        .header("authorization", "Basic dXNlcjpwYXNz")
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = wrong_scheme.json().await.unwrap();
    assert_eq!(body["code"], "missing");

    let garbage = gateway
        .get_as("/api/v1/orders", "not.a.token")
        .send()
        .await
        .unwrap();
    assert_eq!(garbage.status(), StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = garbage.json().await.unwrap();
    assert_eq!(body["code"], "invalid");

    assert_eq!(backend.hits(), 0);
}

#[tokio::test]
async fn role_and_permission_checks() {
    let backend = TestBackend::spawn().await;
    let gateway = TestGateway::start(&platform_config(&backend.addr.to_string(), "")).await;

    let customer = TokenBuilder::new("cust-1").build();
    let admin = TokenBuilder::new("adm-1").role(Role::Admin).build();
    let refunder = TokenBuilder::new("ops-1").permission("refunds:write").build();

    let response = gateway.get_as("/api/v1/admin/users", &customer).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "insufficient_role");

    let response = gateway.get_as("/api/v1/admin/users", &admin).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = gateway.get_as("/api/v1/refunds", &customer).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "insufficient_permission");

    let response = gateway.get_as("/api/v1/refunds", &refunder).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = gateway
        .get_as("/api/v1/users/cust-2/addresses", &customer)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "not_resource_owner");

    let response = gateway
        .get_as("/api/v1/users/cust-1/addresses", &customer)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}


#[tokio::test]
async fn unknown_path_is_not_found() {
    let backend = TestBackend::spawn().await;
    let gateway = TestGateway::start(&platform_config(&backend.addr.to_string(), "")).await;

    let response = gateway.get("/api/v1/ordersfoo").send().await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "route_not_found");
    assert_eq!(backend.hits(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn request_beyond_authenticated_budget_is_rejected() {
    let backend = TestBackend::spawn().await;
    let gateway = TestGateway::start(&platform_config(&backend.addr.to_string(), NO_BURST)).await;
    let token = TokenBuilder::new("cust-bulk").build();

    let statuses: Vec<StatusCode> = stream::iter(0..2000)
        .map(|_| {
            let request = gateway.get_as("/api/v1/orders", &token);
            async move { request.send().await.unwrap().status() }
        })
        .buffer_unordered(32)
        .collect()
        .await;
    assert!(statuses.iter().all(|s| *s == StatusCode::OK));

    let rejected = gateway.get_as("/api/v1/orders", &token).send().await.unwrap();
    assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = rejected.headers()["retry-after"]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after > 0);

    let body: serde_json::Value = rejected.json().await.unwrap();
    assert_eq!(body["code"], "rate_limited");
    assert_eq!(body["retry_after_secs"], retry_after);
    assert_eq!(backend.hits(), 2000);
}

#[tokio::test]
async fn burst_cap_applies_per_caller() {
    let backend = TestBackend::spawn().await;
    let gateway = TestGateway::start(&platform_config(&backend.addr.to_string(), "")).await;
    let first = TokenBuilder::new("cust-a").build();
    let second = TokenBuilder::new("cust-b").build();

    for _ in 0..10 {
        let response = gateway.get_as("/api/v1/orders", &first).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = gateway.get_as("/api/v1/orders", &first).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    let response = gateway.get_as("/api/v1/orders", &second).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
