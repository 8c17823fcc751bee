//! Payment session adapter: minor-unit conversion, session reuse on retry,
//! gateway failure isolation, and the one-shot status poll fallback.

mod common;

use axum::http::Method;
use common::{response_json, TestApp};
use rust_decimal_macros::dec;
use serde_json::json;

use fulfillment_api::entities::ProductCategory;

#[tokio::test]
async fn session_carries_the_total_in_minor_units() {
    let app = TestApp::new().await;
    let product = app
        .seed_product("Keychain", ProductCategory::Accessories, dec!(10.00), 10)
        .await;
    app.add_to_cart("sess-1", product.id, 3).await;
    let (_, order_number) = app.checkout("sess-1").await;

    let response = app
        .request(
            Method::POST,
            &format!("/api/v1/orders/{order_number}/payment-session"),
            None,
        )
        .await;
    assert_eq!(response.status(), 200);
    let body = response_json(response).await;
    assert!(body["data"]["redirect_url"]
        .as_str()
        .unwrap()
        .starts_with("https://"));

    let sessions = app.gateway.sessions.lock().unwrap().clone();
    assert_eq!(sessions.len(), 1);
    // subtotal 30.00 + shipping 5.00, in cents
    assert_eq!(sessions[0].amount, 3500);
    assert_eq!(sessions[0].reference, order_number);
    assert_eq!(sessions[0].line_items.len(), 1);
    assert_eq!(sessions[0].line_items[0].unit_amount, 1000);
}

#[tokio::test]
async fn retrying_session_creation_reuses_the_open_session() {
    let app = TestApp::new().await;
    let product = app
        .seed_product("Socks", ProductCategory::Clothing, dec!(8.00), 10)
        .await;
    app.add_to_cart("sess-2", product.id, 1).await;
    let (_, order_number) = app.checkout("sess-2").await;

    let first = app.open_session(&order_number).await;
    let second = app.open_session(&order_number).await;

    assert_eq!(first, second);
    assert_eq!(app.gateway.session_count(), 1);
}

#[tokio::test]
async fn gateway_failure_surfaces_but_leaves_the_order_intact_for_retry() {
    let app = TestApp::new().await;
    let product = app
        .seed_product("Backpack", ProductCategory::Accessories, dec!(45.00), 5)
        .await;
    app.add_to_cart("sess-3", product.id, 1).await;
    let (order_id, order_number) = app.checkout("sess-3").await;

    app.gateway.set_fail_sessions(true);
    let response = app
        .request(
            Method::POST,
            &format!("/api/v1/orders/{order_number}/payment-session"),
            None,
        )
        .await;
    assert_eq!(response.status(), 502);
    let body = response_json(response).await;
    assert_eq!(body["code"], "PAYMENT_GATEWAY");

    // The order survived the failed session and the same order is retried,
    // not recreated.
    let detail = response_json(
        app.request(Method::GET, &format!("/api/v1/orders/{order_id}"), None)
            .await,
    )
    .await;
    assert_eq!(detail["data"]["status"], "pending");
    assert_eq!(detail["data"]["payment_status"], "pending");

    app.gateway.set_fail_sessions(false);
    let session_id = app.open_session(&order_number).await;
    assert!(!session_id.is_empty());
}

#[tokio::test]
async fn status_poll_applies_a_terminal_gateway_answer() {
    let app = TestApp::new().await;
    let product = app
        .seed_product("Poster", ProductCategory::Accessories, dec!(14.00), 5)
        .await;
    app.add_to_cart("sess-4", product.id, 1).await;
    let (order_id, order_number) = app.checkout("sess-4").await;
    app.open_session(&order_number).await;

    // The webhook never arrived, but the gateway knows the session settled.
    app.gateway.set_poll_status(Some("PAID"));
    let response = app
        .request(
            Method::GET,
            &format!("/api/v1/orders/{order_number}/payment"),
            None,
        )
        .await;
    assert_eq!(response.status(), 200);
    let body = response_json(response).await;
    assert_eq!(body["data"]["payment_status"], "completed");

    let detail = response_json(
        app.request(Method::GET, &format!("/api/v1/orders/{order_id}"), None)
            .await,
    )
    .await;
    assert_eq!(detail["data"]["status"], "confirmed");
    assert!(app.wait_for_issued(order_id, 1).await);
}

#[tokio::test]
async fn poll_failure_returns_the_stored_status() {
    let app = TestApp::new().await;
    let product = app
        .seed_product("Mug", ProductCategory::Accessories, dec!(9.00), 5)
        .await;
    app.add_to_cart("sess-5", product.id, 1).await;
    let (_, order_number) = app.checkout("sess-5").await;
    app.open_session(&order_number).await;

    // poll_status is unset, so the fallback poll errors out.
    let response = app
        .request(
            Method::GET,
            &format!("/api/v1/orders/{order_number}/payment"),
            None,
        )
        .await;
    assert_eq!(response.status(), 200);
    let body = response_json(response).await;
    assert_eq!(body["data"]["payment_status"], "pending");
}

#[tokio::test]
async fn settled_orders_do_not_get_new_sessions() {
    let app = TestApp::new().await;
    let product = app
        .seed_product("Notebook", ProductCategory::Accessories, dec!(6.00), 5)
        .await;
    app.add_to_cart("sess-6", product.id, 1).await;
    let (_, order_number) = app.checkout("sess-6").await;
    let session_id = app.open_session(&order_number).await;
    assert_eq!(
        app.post_webhook(&json!({ "session_id": session_id, "status": "PAID" }), true)
            .await
            .status(),
        200
    );

    let response = app
        .request(
            Method::POST,
            &format!("/api/v1/orders/{order_number}/payment-session"),
            None,
        )
        .await;
    assert_eq!(response.status(), 400);
    let body = response_json(response).await;
    assert_eq!(body["code"], "INVALID_OPERATION");
}
