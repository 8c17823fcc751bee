//! Shared integration test harness: in-memory SQLite, the real router, and
//! recording stubs for the payment gateway and billing provider.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::{Body, Bytes},
    http::{header, Method, Request, Response},
    Router,
};
use chrono::Utc;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter, Set};
use serde_json::{json, Value};
use sha2::Sha256;
use tower::ServiceExt;
use uuid::Uuid;

use fulfillment_api::{
    api_v1_routes,
    clients::{
        billing_provider::{BillingProvider, IssueDocumentRequest, IssuedDocument},
        payment_gateway::{
            CreateSessionRequest, GatewaySession, GatewaySessionStatus, PaymentGateway,
        },
    },
    config::AppConfig,
    db::{self, DbConfig},
    entities::{
        billing_partition, cart_item, inventory_record, product, PartitionStatus, ProductCategory,
    },
    errors::ServiceError,
    events,
    handlers::AppServices,
    AppState,
};

pub const WEBHOOK_SECRET: &str = "test-webhook-secret";

type HmacSha256 = Hmac<Sha256>;

/// Recording stub for the external payment gateway.
#[derive(Default)]
pub struct StubGateway {
    pub sessions: Mutex<Vec<CreateSessionRequest>>,
    /// Status string the one-shot poll reports; `None` makes the poll fail
    pub poll_status: Mutex<Option<String>>,
    pub fail_sessions: Mutex<bool>,
}

impl StubGateway {
    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn set_fail_sessions(&self, fail: bool) {
        *self.fail_sessions.lock().unwrap() = fail;
    }

    pub fn set_poll_status(&self, status: Option<&str>) {
        *self.poll_status.lock().unwrap() = status.map(str::to_string);
    }
}

#[async_trait]
impl PaymentGateway for StubGateway {
    async fn create_session(
        &self,
        request: &CreateSessionRequest,
    ) -> Result<GatewaySession, ServiceError> {
        if *self.fail_sessions.lock().unwrap() {
            return Err(ServiceError::PaymentGateway("gateway down".to_string()));
        }
        let mut sessions = self.sessions.lock().unwrap();
        sessions.push(request.clone());
        Ok(GatewaySession {
            session_id: format!("sess_{}_{}", request.reference, sessions.len()),
            redirect_url: format!("https://gateway.test/pay/{}", request.reference),
        })
    }

    async fn fetch_status(&self, session_id: &str) -> Result<GatewaySessionStatus, ServiceError> {
        match self.poll_status.lock().unwrap().clone() {
            Some(status) => Ok(GatewaySessionStatus {
                session_id: session_id.to_string(),
                status,
            }),
            None => Err(ServiceError::PaymentGateway("poll unavailable".to_string())),
        }
    }
}

/// Recording stub for the external billing document service.
#[derive(Default)]
pub struct StubBilling {
    pub issued: Mutex<Vec<IssueDocumentRequest>>,
    pub fail: Mutex<bool>,
}

impl StubBilling {
    pub fn issued_count(&self) -> usize {
        self.issued.lock().unwrap().len()
    }

    pub fn set_fail(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }
}

#[async_trait]
impl BillingProvider for StubBilling {
    async fn issue_document(
        &self,
        request: &IssueDocumentRequest,
    ) -> Result<IssuedDocument, ServiceError> {
        if *self.fail.lock().unwrap() {
            return Err(ServiceError::BillingProvider("billing down".to_string()));
        }
        let mut issued = self.issued.lock().unwrap();
        issued.push(request.clone());
        Ok(IssuedDocument {
            document_ref: format!("DOC-{:04}", issued.len()),
        })
    }
}

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub gateway: Arc<StubGateway>,
    pub billing: Arc<StubBilling>,
}

impl TestApp {
    pub async fn new() -> Self {
        let config = AppConfig {
            database_url: "sqlite::memory:".to_string(),
            shipping_flat_rate: Decimal::new(500, 2),
            free_shipping_threshold: None,
            gateway: fulfillment_api::config::GatewayConfig {
                webhook_secret: WEBHOOK_SECRET.to_string(),
                ..Default::default()
            },
            ..AppConfig::default()
        };

        // A single pooled connection keeps the in-memory database alive and
        // serializes transactions the way a real store serializes row locks.
        let db_config = DbConfig {
            url: config.database_url.clone(),
            max_connections: 1,
            min_connections: 1,
            ..Default::default()
        };
        let db = Arc::new(
            db::establish_connection_with_config(&db_config)
                .await
                .expect("database connection"),
        );
        db::ensure_schema(&db).await.expect("schema bootstrap");

        let gateway = Arc::new(StubGateway::default());
        let billing = Arc::new(StubBilling::default());

        let (event_sender, event_rx) = events::channel(64);
        let services = AppServices::new(
            db.clone(),
            config.clone(),
            event_sender.clone(),
            gateway.clone() as Arc<dyn PaymentGateway>,
            billing.clone() as Arc<dyn BillingProvider>,
        );
        tokio::spawn(events::process_events(event_rx, services.billing.clone()));

        let state = AppState {
            db,
            config,
            event_sender,
            services,
        };
        let router = Router::new()
            .nest("/api/v1", api_v1_routes())
            .with_state(state.clone());

        Self {
            router,
            state,
            gateway,
            billing,
        }
    }

    pub async fn seed_product(
        &self,
        name: &str,
        category: ProductCategory,
        unit_price: Decimal,
        stock: i32,
    ) -> product::Model {
        let model = product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            unit_price: Set(unit_price),
            category: Set(category),
            is_active: Set(true),
            created_at: Set(Utc::now()),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed product");

        inventory_record::ActiveModel {
            product_id: Set(model.id),
            available: Set(stock),
            updated_at: Set(Utc::now()),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed inventory");

        model
    }

    pub async fn deactivate_product(&self, product_id: Uuid) {
        let model = product::Entity::find_by_id(product_id)
            .one(&*self.state.db)
            .await
            .expect("find product")
            .expect("product exists");
        let mut active: product::ActiveModel = model.into();
        active.is_active = Set(false);
        active.update(&*self.state.db).await.expect("deactivate");
    }

    pub async fn add_to_cart(&self, cart_ref: &str, product_id: Uuid, quantity: i32) {
        cart_item::ActiveModel {
            id: Set(Uuid::new_v4()),
            cart_ref: Set(cart_ref.to_string()),
            product_id: Set(product_id),
            quantity: Set(quantity),
            created_at: Set(Utc::now()),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed cart item");
    }

    pub async fn stock_of(&self, product_id: Uuid) -> i32 {
        inventory_record::Entity::find_by_id(product_id)
            .one(&*self.state.db)
            .await
            .expect("inventory query")
            .map(|record| record.available)
            .unwrap_or(0)
    }

    pub async fn cart_size(&self, cart_ref: &str) -> u64 {
        cart_item::Entity::find()
            .filter(cart_item::Column::CartRef.eq(cart_ref))
            .count(&*self.state.db)
            .await
            .expect("cart count")
    }

    pub async fn request(&self, method: Method, uri: &str, body: Option<Value>) -> Response<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        self.router
            .clone()
            .oneshot(builder.body(body).expect("request build"))
            .await
            .expect("request dispatch")
    }

    /// Creates an order from the given cart through the API, returning the
    /// order id and number.
    pub async fn checkout(&self, cart_ref: &str) -> (Uuid, String) {
        let response = self
            .request(
                Method::POST,
                "/api/v1/orders",
                Some(json!({
                    "cart_ref": cart_ref,
                    "buyer_name": "Ada Lovelace",
                    "buyer_email": "ada@example.com",
                    "shipping_address": "12 Analytical Way, London",
                })),
            )
            .await;
        assert_eq!(response.status(), 201, "checkout should succeed");
        let body = response_json(response).await;
        let id = Uuid::parse_str(body["data"]["id"].as_str().unwrap()).unwrap();
        let number = body["data"]["order_number"].as_str().unwrap().to_string();
        (id, number)
    }

    /// Opens a payment session for an order, returning the gateway handle.
    pub async fn open_session(&self, order_ref: &str) -> String {
        let response = self
            .request(
                Method::POST,
                &format!("/api/v1/orders/{order_ref}/payment-session"),
                None,
            )
            .await;
        assert_eq!(response.status(), 200, "session should open");
        let body = response_json(response).await;
        body["data"]["session_id"].as_str().unwrap().to_string()
    }

    /// Posts a gateway notification with a signature computed from either the
    /// real shared secret or a wrong one.
    pub async fn post_webhook(&self, payload: &Value, valid_signature: bool) -> Response<Body> {
        let body = payload.to_string();
        let secret = if valid_signature {
            WEBHOOK_SECRET.as_bytes()
        } else {
            b"wrong-secret".as_slice()
        };
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/payments/webhook")
            .header(header::CONTENT_TYPE, "application/json")
            .header("x-gateway-signature", sign(secret, body.as_bytes()))
            .header("x-gateway-signature-alg", "hmac-sha256")
            .body(Body::from(body))
            .expect("webhook request build");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("webhook dispatch")
    }

    /// Waits until `expected` of the order's partitions are issued, bounded;
    /// issuance runs on the spawned event worker.
    pub async fn wait_for_issued(&self, order_id: Uuid, expected: u64) -> bool {
        for _ in 0..200 {
            let issued = billing_partition::Entity::find()
                .filter(billing_partition::Column::OrderId.eq(order_id))
                .filter(billing_partition::Column::Status.eq(PartitionStatus::Issued))
                .count(&*self.state.db)
                .await
                .expect("partition count");
            if issued == expected {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    /// Gives the event worker a moment to drain, for assertions that nothing
    /// further happened.
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

pub fn sign(secret: &[u8], payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac key");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

pub async fn response_json(response: Response<Body>) -> Value {
    let bytes: Bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body");
    serde_json::from_slice(&bytes).expect("json response")
}

pub fn decimal(value: &Value) -> Decimal {
    serde_json::from_value(value.clone()).expect("decimal field")
}
