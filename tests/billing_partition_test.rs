//! Billing document issuance: partition completeness, the money identity
//! across split documents, idempotency, and best-effort deferral on
//! provider outages.

mod common;

use axum::http::Method;
use common::{decimal, response_json, TestApp};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;

use fulfillment_api::entities::ProductCategory;
use fulfillment_api::errors::ServiceError;

#[tokio::test]
async fn paid_standard_order_issues_one_full_document() {
    let app = TestApp::new().await;
    let product = app
        .seed_product("Linen shirt", ProductCategory::Clothing, dec!(10.00), 10)
        .await;
    app.add_to_cart("bill-1", product.id, 3).await;
    let (order_id, order_number) = app.checkout("bill-1").await;
    let session_id = app.open_session(&order_number).await;

    // Stock decreased by the ordered quantity at creation time.
    assert_eq!(app.stock_of(product.id).await, 7);

    assert_eq!(
        app.post_webhook(&json!({ "session_id": session_id, "status": "COMPLETED" }), true)
            .await
            .status(),
        200
    );
    assert!(app.wait_for_issued(order_id, 1).await);

    let issued = app.billing.issued.lock().unwrap().clone();
    assert_eq!(issued.len(), 1);
    let document = &issued[0];
    assert_eq!(document.scope, "full");
    assert_eq!(document.order_number, order_number);
    assert_eq!(document.lines.len(), 1);
    assert_eq!(document.lines[0].quantity, 3);
    assert_eq!(document.shipping, dec!(5.00));
    // subtotal 30.00 + shipping 5.00
    assert_eq!(document.total, dec!(35.00));
}

#[tokio::test]
async fn split_order_issues_two_scoped_documents_summing_to_the_total() {
    let app = TestApp::new().await;
    let belt = app
        .seed_product("Belt", ProductCategory::Accessories, dec!(10.00), 5)
        .await;
    let coat = app
        .seed_product("Coat", ProductCategory::Clothing, dec!(80.00), 5)
        .await;
    app.add_to_cart("bill-2", belt.id, 2).await;
    app.add_to_cart("bill-2", coat.id, 1).await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(json!({
                "cart_ref": "bill-2",
                "buyer_name": "Ada Lovelace",
                "buyer_email": "ada@example.com",
                "shipping_address": "12 Analytical Way, London",
                "company_name": "Analytical Engines Ltd",
                "tax_id": "GB123456789",
                "shipment_preference": "split",
            })),
        )
        .await;
    assert_eq!(response.status(), 201);
    let body = response_json(response).await;
    let order_id = body["data"]["id"].as_str().unwrap().parse().unwrap();
    let order_total = decimal(&body["data"]["total"]);
    let order_number = body["data"]["order_number"].as_str().unwrap().to_string();

    let session_id = app.open_session(&order_number).await;
    assert_eq!(
        app.post_webhook(&json!({ "session_id": session_id, "status": "PAID" }), true)
            .await
            .status(),
        200
    );
    assert!(app.wait_for_issued(order_id, 2).await);

    let issued = app.billing.issued.lock().unwrap().clone();
    assert_eq!(issued.len(), 2);
    let accessories = issued.iter().find(|d| d.scope == "accessories").unwrap();
    let clothing = issued.iter().find(|d| d.scope == "clothing").unwrap();

    // Each document covers exactly its category's lines, with no overlap
    // and no omission across the pair.
    assert_eq!(accessories.lines.len(), 1);
    assert_eq!(accessories.lines[0].description, "Belt");
    assert_eq!(clothing.lines.len(), 1);
    assert_eq!(clothing.lines[0].description, "Coat");

    // The document buyer is the company identity when one was provided.
    assert_eq!(
        accessories.buyer.company_name.as_deref(),
        Some("Analytical Engines Ltd")
    );
    assert_eq!(accessories.buyer.tax_id.as_deref(), Some("GB123456789"));

    // Shipping rides the first-shipping (stock) document only, and the two
    // document totals reconstruct the order total exactly.
    assert_eq!(accessories.shipping, dec!(5.00));
    assert_eq!(clothing.shipping, Decimal::ZERO);
    assert_eq!(accessories.total + clothing.total, order_total);
}

#[tokio::test]
async fn billing_outage_defers_issuance_without_touching_payment_state() {
    let app = TestApp::new().await;
    let product = app
        .seed_product("Silk tie", ProductCategory::Accessories, dec!(25.00), 10)
        .await;
    app.add_to_cart("bill-3", product.id, 1).await;
    let (order_id, order_number) = app.checkout("bill-3").await;
    let session_id = app.open_session(&order_number).await;

    app.billing.set_fail(true);
    assert_eq!(
        app.post_webhook(&json!({ "session_id": session_id, "status": "PAID" }), true)
            .await
            .status(),
        200
    );
    app.settle().await;

    // Payment confirmation survived the outage; the partition is pending.
    let detail = response_json(
        app.request(Method::GET, &format!("/api/v1/orders/{order_id}"), None)
            .await,
    )
    .await;
    assert_eq!(detail["data"]["payment_status"], "completed");
    assert_eq!(detail["data"]["status"], "confirmed");
    let partitions = detail["data"]["partitions"].as_array().unwrap();
    assert_eq!(partitions[0]["status"], "pending");
    assert_eq!(app.billing.issued_count(), 0);

    // Once the provider recovers, the status query re-triggers issuance.
    app.billing.set_fail(false);
    let response = app
        .request(
            Method::GET,
            &format!("/api/v1/orders/{order_id}/payment"),
            None,
        )
        .await;
    assert_eq!(response.status(), 200);
    assert!(app.wait_for_issued(order_id, 1).await);
    assert_eq!(app.billing.issued_count(), 1);

    let detail = response_json(
        app.request(Method::GET, &format!("/api/v1/orders/{order_id}"), None)
            .await,
    )
    .await;
    let partitions = detail["data"]["partitions"].as_array().unwrap();
    assert_eq!(partitions[0]["status"], "issued");
    assert!(!partitions[0]["document_ref"].is_null());
}

#[tokio::test]
async fn issuance_requires_a_completed_payment() {
    let app = TestApp::new().await;
    let product = app
        .seed_product("Beanie", ProductCategory::Clothing, dec!(12.00), 5)
        .await;
    app.add_to_cart("bill-4", product.id, 1).await;
    let (order_id, _) = app.checkout("bill-4").await;

    let result = app.state.services.billing.issue_documents(order_id).await;
    assert!(matches!(result, Err(ServiceError::InvalidOperation(_))));
    assert_eq!(app.billing.issued_count(), 0);
}
