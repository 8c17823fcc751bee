use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{debug, error, warn};

use crate::{services::payments::GatewayNotification, AppState};

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_HEADER: &str = "x-gateway-signature";
const ALGORITHM_HEADER: &str = "x-gateway-signature-alg";

#[derive(Debug, Deserialize)]
struct WebhookBody {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default, alias = "reference")]
    order_number: Option<String>,
    status: String,
}

/// Gateway notification endpoint. Deliveries are at-least-once and may be
/// reordered, so this endpoint always acknowledges with 200: any non-success
/// answer would only trigger the gateway's redelivery storm. A signature
/// mismatch is logged as a security event and flags the attempt for manual
/// review, but does not reject the notification.
#[utoipa::path(
    post,
    path = "/api/v1/payments/webhook",
    request_body = String,
    responses(
        (status = 200, description = "Notification acknowledged")
    ),
    tag = "Payments"
)]
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    let signature_valid = verify_signature(
        &headers,
        &body,
        state.config.gateway.webhook_secret.as_bytes(),
    );
    if !signature_valid {
        warn!("Payment webhook signature mismatch; accepting but flagging for manual review");
    }

    let notification = match parse_notification(&body, signature_valid) {
        Ok(notification) => notification,
        Err(reason) => {
            warn!(reason = %reason, "Undecodable payment webhook payload; acknowledging");
            return ack();
        }
    };

    match state.services.payments.apply_notification(notification).await {
        Ok(outcome) => debug!(outcome = ?outcome, "Payment webhook processed"),
        Err(e) => {
            error!(error = %e, "Payment webhook processing failed; acknowledging anyway");
        }
    }

    ack()
}

fn ack() -> (StatusCode, Json<Value>) {
    (StatusCode::OK, Json(json!({ "received": true })))
}

fn parse_notification(body: &[u8], signature_valid: bool) -> Result<GatewayNotification, String> {
    let raw: Value = serde_json::from_slice(body).map_err(|e| format!("invalid json: {e}"))?;
    let parsed: WebhookBody =
        serde_json::from_value(raw.clone()).map_err(|e| format!("unexpected shape: {e}"))?;
    Ok(GatewayNotification {
        session_id: parsed.session_id,
        order_number: parsed.order_number,
        status: parsed.status,
        payload: raw,
        signature_valid,
    })
}

/// Recomputes the HMAC-SHA256 of the raw payload and compares it against the
/// signature header in constant time. The algorithm tag, when present, must
/// name hmac-sha256.
fn verify_signature(headers: &HeaderMap, payload: &[u8], secret: &[u8]) -> bool {
    let Some(signature) = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    if let Some(algorithm) = headers.get(ALGORITHM_HEADER).and_then(|v| v.to_str().ok()) {
        if !algorithm.eq_ignore_ascii_case("hmac-sha256") {
            return false;
        }
    }

    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(payload);
    let expected = hex::encode(mac.finalize().into_bytes());
    constant_time_eq(&expected, signature)
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) {
        diff |= x ^ y;
    }
    diff == 0
}

pub fn webhook_routes() -> Router<AppState> {
    Router::new().route("/payments/webhook", post(payment_webhook))
}
