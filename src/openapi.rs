use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::{entities, errors, handlers, services};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "fulfillment-api",
        description = "Order fulfillment core: transactional order creation, payment reconciliation, billing document issuance"
    ),
    paths(
        handlers::orders::create_order,
        handlers::orders::get_order,
        handlers::orders::cancel_order,
        handlers::payments::create_payment_session,
        handlers::payments::payment_status,
        handlers::payment_webhooks::payment_webhook,
    ),
    components(schemas(
        errors::ErrorResponse,
        services::orders::CreateOrderRequest,
        services::orders::OrderResponse,
        services::orders::OrderLineResponse,
        services::orders::PartitionResponse,
        services::orders::OrderDetailResponse,
        services::payments::CheckoutRedirect,
        services::payments::PaymentStatusResponse,
        entities::OrderStatus,
        entities::PaymentStatus,
        entities::ShipmentMode,
        entities::ProductCategory,
        entities::PartitionScope,
        entities::PartitionStatus,
    )),
    tags(
        (name = "Orders", description = "Order creation and lifecycle"),
        (name = "Payments", description = "Payment sessions and reconciliation")
    )
)]
pub struct ApiDoc;

pub fn swagger_ui() -> SwaggerUi {
    SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi())
}
