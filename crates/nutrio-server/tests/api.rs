//! HTTP tests for the payment and entitlement routes.
//!
//! The router runs on the in-memory store, so these need no database.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use chrono::Utc;
use nutrio_receipts::ProductCatalog;
use nutrio_server::store::MemoryStore;
use nutrio_server::{
    create_router, stripe, AppState, EngineSettings, PaymentEngine, ServerSettings,
};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

const WEBHOOK_SECRET: &str = "whsec_test_secret";

fn fixture(name: &str) -> String {
    let path = format!("{}/../../fixtures/{}", env!("CARGO_MANIFEST_DIR"), name);
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("Failed to read {}: {}", path, e))
}

fn app() -> Router {
    app_with(ServerSettings {
        stripe_webhook_secret: Some(WEBHOOK_SECRET.to_string()),
        retry_after_secs: 30,
        checkout_base_url: None,
    })
}

fn app_with(settings: ServerSettings) -> Router {
    let catalog = ProductCatalog::from_json(&fixture("catalog.json")).expect("valid catalog");
    let engine = PaymentEngine::new(
        Arc::new(MemoryStore::new()),
        Arc::new(catalog),
        EngineSettings::default(),
    );
    create_router(AppState::new(engine, settings))
}

/// Helper to parse JSON response body.
async fn json_body(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("Failed to read response body");
    serde_json::from_slice(&body).expect("Failed to parse JSON response")
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn receipt_request(user_id: Uuid, receipt_fixture: &str) -> Request<Body> {
    let receipt: Value = serde_json::from_str(&fixture(receipt_fixture)).unwrap();
    post_json(
        "/api/v1/payments/apple/receipt",
        json!({ "userId": user_id, "receipt": receipt }),
    )
}

fn checkout_event(user_id: Uuid, session_id: &str, amount_total: i64) -> Vec<u8> {
    json!({
        "id": format!("evt_{}", session_id),
        "type": "checkout.session.completed",
        "data": {
            "object": {
                "id": session_id,
                "payment_status": "paid",
                "amount_total": amount_total,
                "currency": "usd",
                "metadata": {
                    "user_id": user_id.to_string(),
                    "price_id": "price_premium_monthly"
                }
            }
        }
    })
    .to_string()
    .into_bytes()
}

fn signed_webhook(payload: Vec<u8>, secret: &str) -> Request<Body> {
    let timestamp = Utc::now().timestamp();
    let signature = stripe::compute_signature(secret, timestamp, &payload);
    Request::builder()
        .method("POST")
        .uri("/api/v1/payments/webhook/stripe")
        .header(header::CONTENT_TYPE, "application/json")
        .header("Stripe-Signature", format!("t={},v1={}", timestamp, signature))
        .body(Body::from(payload))
        .unwrap()
}

#[tokio::test]
async fn test_submit_receipt_then_resubmit() {
    let app = app();
    let user_id = Uuid::new_v4();

    let response = app
        .clone()
        .oneshot(receipt_request(user_id, "receipts/bundled.json"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["outcomes"][0]["outcome"], "processed");
    assert_eq!(body["outcomes"][0]["order"]["externalId"], "2000000456789012");
    assert_eq!(body["outcomes"][0]["order"]["status"], "paid");
    assert_eq!(body["outcomes"][0]["ledger"]["result"], "applied");
    assert_eq!(body["outcomes"][0]["ledger"]["balance"], 100);
    assert_eq!(body["outcomes"][1]["ledger"]["result"], "not_applicable");

    let response = app
        .clone()
        .oneshot(receipt_request(user_id, "receipts/bundled.json"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["outcomes"][0]["outcome"], "already_processed");
    assert_eq!(body["outcomes"][1]["outcome"], "already_processed");

    let response = app
        .oneshot(get(&format!("/api/v1/entitlements/users/{}/coins", user_id)))
        .await
        .unwrap();
    assert_eq!(json_body(response).await["balance"], 100);
}

#[tokio::test]
async fn test_transient_receipt_returns_retry_after() {
    let response = app()
        .oneshot(receipt_request(Uuid::new_v4(), "receipts/transient.json"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.headers()[header::RETRY_AFTER], "30");
    let body = json_body(response).await;
    assert_eq!(body["outcomes"][0]["outcome"], "retry_later");
    assert_eq!(body["outcomes"][0]["status"], 21005);
}

#[tokio::test]
async fn test_rejected_receipt_is_unprocessable() {
    let response = app()
        .oneshot(post_json(
            "/api/v1/payments/apple/receipt",
            json!({ "userId": Uuid::new_v4(), "receipt": { "status": 21003 } }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = json_body(response).await;
    assert_eq!(body["outcomes"][0]["outcome"], "rejected");
    assert_eq!(body["outcomes"][0]["status"], 21003);
}

#[tokio::test]
async fn test_create_checkout_session() {
    let app = app();

    let user_id = Uuid::new_v4();

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/v1/payments/checkout/session",
            json!({
                "userId": user_id,
                "priceId": "price_premium_yearly",
                "successUrl": "https://nutrio.app/paid",
                "cancelUrl": "https://nutrio.app/cancel"
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["productId"], "premium_yearly");
    assert!(body["sessionId"].as_str().unwrap().starts_with("cs_"));
    assert_eq!(body["metadata"]["user_id"], user_id.to_string());
    assert_eq!(body["metadata"]["price_id"], "price_premium_yearly");
    assert!(body.get("url").is_none());

    let unknown = app
        .clone()
        .oneshot(post_json(
            "/api/v1/payments/checkout/session",
            json!({
                "userId": Uuid::new_v4(),
                "priceId": "price_gold",
                "successUrl": "https://nutrio.app/paid",
                "cancelUrl": "https://nutrio.app/cancel"
            }),
        ))
        .await
        .unwrap();
    assert_eq!(unknown.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let bad_url = app
        .oneshot(post_json(
            "/api/v1/payments/checkout/session",
            json!({
                "userId": Uuid::new_v4(),
                "priceId": "price_premium_yearly",
                "successUrl": "nutrio://paid",
                "cancelUrl": "https://nutrio.app/cancel"
            }),
        ))
        .await
        .unwrap();
    assert_eq!(bad_url.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_checkout_session_url_uses_configured_page() {
    let app = app_with(ServerSettings {
        stripe_webhook_secret: Some(WEBHOOK_SECRET.to_string()),
        retry_after_secs: 30,
        checkout_base_url: Some("https://pay.nutrio.app/checkout".to_string()),
    });

    let response = app
        .oneshot(post_json(
            "/api/v1/payments/checkout/session",
            json!({
                "userId": Uuid::new_v4(),
                "priceId": "price_premium_yearly",
                "successUrl": "https://nutrio.app/paid",
                "cancelUrl": "https://nutrio.app/cancel"
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(
        body["url"],
        format!(
            "https://pay.nutrio.app/checkout/{}",
            body["sessionId"].as_str().unwrap()
        )
    );
}

#[tokio::test]
async fn test_signed_webhook_grants_entitlement() {
    let app = app();
    let user_id = Uuid::new_v4();

    let response = app
        .clone()
        .oneshot(signed_webhook(
            checkout_event(user_id, "cs_test_paid", 999),
            WEBHOOK_SECRET,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["received"], true);
    assert_eq!(body["outcome"]["outcome"], "processed");
    assert_eq!(body["outcome"]["order"]["paymentMethod"], "card_gateway");

    // Stripe redelivers until it sees a 2xx
    let response = app
        .clone()
        .oneshot(signed_webhook(
            checkout_event(user_id, "cs_test_paid", 999),
            WEBHOOK_SECRET,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        json_body(response).await["outcome"]["outcome"],
        "already_processed"
    );

    let response = app
        .clone()
        .oneshot(get(&format!(
            "/api/v1/entitlements/users/{}/products/premium_monthly",
            user_id
        )))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["entitled"], true);
    assert_eq!(body["validDays"], 30);

    let response = app
        .oneshot(get("/api/v1/payments/orders/card_gateway/cs_test_paid"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["productName"], "Premium (monthly)");
    assert_eq!(body["subscription"], true);
    assert_eq!(body["ledgerState"], "applied");
}

#[tokio::test]
async fn test_webhook_signature_is_enforced() {
    let app = app();
    let user_id = Uuid::new_v4();

    let forged = app
        .clone()
        .oneshot(signed_webhook(
            checkout_event(user_id, "cs_test_forged", 999),
            "whsec_wrong",
        ))
        .await
        .unwrap();
    assert_eq!(forged.status(), StatusCode::UNAUTHORIZED);

    let unsigned = app
        .clone()
        .oneshot(post_json(
            "/api/v1/payments/webhook/stripe",
            serde_json::from_slice(&checkout_event(user_id, "cs_test_unsigned", 999)).unwrap(),
        ))
        .await
        .unwrap();
    assert_eq!(unsigned.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(get("/api/v1/payments/orders/card_gateway/cs_test_forged"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_webhook_ignores_other_events() {
    let payload = json!({
        "id": "evt_invoice",
        "type": "invoice.payment_succeeded",
        "data": { "object": { "id": "in_1" } }
    })
    .to_string()
    .into_bytes();

    let response = app()
        .oneshot(signed_webhook(payload, WEBHOOK_SECRET))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["ignored"], "event type invoice.payment_succeeded");
    assert!(body.get("outcome").is_none());
}

#[tokio::test]
async fn test_reverse_order_route() {
    let app = app();
    let user_id = Uuid::new_v4();

    app.clone()
        .oneshot(signed_webhook(
            checkout_event(user_id, "cs_test_refund", 999),
            WEBHOOK_SECRET,
        ))
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/v1/payments/orders/card_gateway/cs_test_refund/reverse",
            json!({ "reason": "requested_by_customer" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["order"]["status"], "refunded");
    assert_eq!(body["alreadyRefunded"], false);
    assert_eq!(body["compensation"]["result"], "reversed");
    assert_eq!(body["compensation"]["coinsRevoked"], 100);

    let response = app
        .clone()
        .oneshot(get(&format!("/api/v1/entitlements/users/{}/coins", user_id)))
        .await
        .unwrap();
    assert_eq!(json_body(response).await["balance"], 0);

    let missing = app
        .clone()
        .oneshot(post_json(
            "/api/v1/payments/orders/apple_iap/404/reverse",
            json!({ "reason": "refund" }),
        ))
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let bad_method = app
        .oneshot(get("/api/v1/payments/orders/paypal/cs_test_refund"))
        .await
        .unwrap();
    assert_eq!(bad_method.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_ledger_retry_route() {
    let app = app();

    let response = app
        .clone()
        .oneshot(post_json("/api/v1/payments/ledger/retry", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["examined"], 0);
    assert_eq!(body["applied"], 0);

    let response = app
        .oneshot(post_json(
            "/api/v1/payments/ledger/retry",
            json!({ "limit": 0 }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_product_entitlement_is_not_found() {
    let response = app()
        .oneshot(get(&format!(
            "/api/v1/entitlements/users/{}/products/gold_lifetime",
            Uuid::new_v4()
        )))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
