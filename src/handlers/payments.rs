use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use crate::{
    errors::ServiceError,
    services::payments::{CheckoutRedirect, PaymentStatusResponse},
    ApiResponse, AppState,
};

/// Open (or reuse) a payment session for an order
#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/payment-session",
    params(("id" = String, Path, description = "Order UUID or order number")),
    responses(
        (status = 200, description = "Session ready", body = CheckoutRedirect),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 400, description = "Payment already settled", body = crate::errors::ErrorResponse),
        (status = 502, description = "Gateway unavailable; order intact, retry later", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn create_payment_session(
    State(state): State<AppState>,
    Path(reference): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let order = state.services.orders.find_by_reference(&reference).await?;
    let redirect = state.services.payments.create_session(order.id).await?;
    Ok(Json(ApiResponse::success(redirect)))
}

/// Current payment status, polling the gateway once while non-terminal
#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}/payment",
    params(("id" = String, Path, description = "Order UUID or order number")),
    responses(
        (status = 200, description = "Payment status", body = PaymentStatusResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn payment_status(
    State(state): State<AppState>,
    Path(reference): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let order = state.services.orders.find_by_reference(&reference).await?;
    let status = state.services.payments.payment_status(order.id).await?;
    Ok(Json(ApiResponse::success(status)))
}

pub fn payment_routes() -> Router<AppState> {
    Router::new()
        .route("/orders/:id/payment-session", post(create_payment_session))
        .route("/orders/:id/payment", get(payment_status))
}
