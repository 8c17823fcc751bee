use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, ModelTrait, PaginatorTrait,
    QueryFilter, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    config::AppConfig,
    entities::{
        billing_partition, cart_item, order, order_line, payment_attempt,
        product::{self, ProductCategory},
        OrderStatus, PartitionScope, PartitionStatus, PaymentStatus, ShipmentMode,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{inventory, order_number},
};

/// Collisions on the date-seeded order number are rare; each retry runs a
/// fresh transaction with a newly generated candidate.
const MAX_ORDER_NUMBER_ATTEMPTS: u32 = 5;

#[derive(Debug, Serialize, Deserialize, Validate, ToSchema)]
pub struct CreateOrderRequest {
    /// Session or account reference the server-side cart is keyed by
    #[validate(length(min = 1, message = "Cart reference is required"))]
    pub cart_ref: String,

    #[validate(length(
        min = 1,
        max = 120,
        message = "Buyer name must be between 1 and 120 characters"
    ))]
    pub buyer_name: String,

    #[validate(email(message = "Buyer email must be a valid address"))]
    pub buyer_email: String,

    pub buyer_phone: Option<String>,

    #[validate(length(min = 1, message = "Shipping address is required"))]
    pub shipping_address: String,

    /// Billing documents name the company + tax id when provided
    pub company_name: Option<String>,
    pub tax_id: Option<String>,

    /// Honored only when the cart spans both shipment-category groups;
    /// otherwise the order falls back to standard shipment
    #[serde(default)]
    pub shipment_preference: Option<ShipmentMode>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrderResponse {
    pub id: Uuid,
    pub order_number: String,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub shipment_mode: ShipmentMode,
    pub subtotal: Decimal,
    pub shipping_cost: Decimal,
    pub discount: Decimal,
    pub total: Decimal,
    pub currency: String,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl From<order::Model> for OrderResponse {
    fn from(model: order::Model) -> Self {
        Self {
            id: model.id,
            order_number: model.order_number,
            status: model.status,
            payment_status: model.payment_status,
            shipment_mode: model.shipment_mode,
            subtotal: model.subtotal,
            shipping_cost: model.shipping_cost,
            discount: model.discount,
            total: model.total,
            currency: model.currency,
            created_at: model.created_at,
            paid_at: model.paid_at,
            cancelled_at: model.cancelled_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct OrderLineResponse {
    pub product_id: Uuid,
    pub name: String,
    pub category: ProductCategory,
    pub unit_price: Decimal,
    pub quantity: i32,
    pub line_total: Decimal,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PartitionResponse {
    pub id: Uuid,
    pub scope: PartitionScope,
    pub status: PartitionStatus,
    pub subtotal: Decimal,
    pub shipping_allocation: Decimal,
    pub discount_allocation: Decimal,
    pub document_ref: Option<String>,
    pub issued_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct OrderDetailResponse {
    #[serde(flatten)]
    pub order: OrderResponse,
    pub lines: Vec<OrderLineResponse>,
    pub partitions: Vec<PartitionResponse>,
}

enum CreateAttempt {
    Created(order::Model),
    NumberCollision(String),
}

/// Owns order creation and the cancellation path; the only two writers of
/// the inventory ledger.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    config: AppConfig,
    event_sender: EventSender,
}

impl OrderService {
    pub fn new(db: Arc<DatabaseConnection>, config: AppConfig, event_sender: EventSender) -> Self {
        Self {
            db,
            config,
            event_sender,
        }
    }

    /// Creates exactly one order (with lines and billing partitions) and
    /// durably decrements inventory, or makes no change at all. Retries the
    /// whole transaction on an order-number collision, up to a fixed bound.
    #[instrument(skip(self, request), fields(cart_ref = %request.cart_ref))]
    pub async fn create_order(
        &self,
        request: CreateOrderRequest,
    ) -> Result<OrderResponse, ServiceError> {
        request
            .validate()
            .map_err(|e| ServiceError::ValidationError(e.to_string()))?;

        for attempt in 1..=MAX_ORDER_NUMBER_ATTEMPTS {
            match self.try_create(&request).await? {
                CreateAttempt::Created(model) => {
                    info!(
                        order_id = %model.id,
                        order_number = %model.order_number,
                        total = %model.total,
                        "Order created"
                    );
                    if let Err(e) = self.event_sender.send(Event::OrderCreated(model.id)).await {
                        warn!(error = %e, "Failed to send order created event");
                    }
                    return Ok(model.into());
                }
                CreateAttempt::NumberCollision(number) => {
                    warn!(
                        order_number = %number,
                        attempt,
                        "Order number collision; retrying with a fresh number"
                    );
                }
            }
        }

        Err(ServiceError::OrderCreationFailed)
    }

    /// One creation attempt inside a single transaction. Returning an error
    /// rolls back every step, including the order-number reservation.
    async fn try_create(&self, request: &CreateOrderRequest) -> Result<CreateAttempt, ServiceError> {
        let txn = self.db.begin().await?;

        let cart_lines = cart_item::Entity::find()
            .filter(cart_item::Column::CartRef.eq(request.cart_ref.clone()))
            .all(&txn)
            .await?;
        if cart_lines.is_empty() {
            return Err(ServiceError::ValidationError("Cart is empty".to_string()));
        }

        let candidate = order_number::generate();
        let clash = order::Entity::find()
            .filter(order::Column::OrderNumber.eq(candidate.clone()))
            .count(&txn)
            .await?;
        if clash > 0 {
            txn.rollback().await?;
            return Ok(CreateAttempt::NumberCollision(candidate));
        }

        // Re-validate every line against live product and stock state inside
        // the transaction; pre-transaction reads are not trusted.
        let mut validated: Vec<(product::Model, i32)> = Vec::with_capacity(cart_lines.len());
        let mut subtotal = Decimal::ZERO;
        let mut accessories_subtotal = Decimal::ZERO;
        let mut clothing_subtotal = Decimal::ZERO;
        for item in &cart_lines {
            if item.quantity <= 0 {
                return Err(ServiceError::ValidationError(format!(
                    "Invalid quantity {} for product {}",
                    item.quantity, item.product_id
                )));
            }
            let product = match product::Entity::find_by_id(item.product_id).one(&txn).await? {
                Some(p) if p.is_active => p,
                Some(p) => return Err(ServiceError::ProductUnavailable(p.name)),
                None => {
                    return Err(ServiceError::ProductUnavailable(item.product_id.to_string()))
                }
            };
            let on_hand = inventory::available(&txn, product.id).await?;
            if on_hand < item.quantity {
                return Err(ServiceError::InsufficientStock(product.name.clone()));
            }

            let line_total = product.unit_price * Decimal::from(item.quantity);
            subtotal += line_total;
            match product.category {
                ProductCategory::Accessories => accessories_subtotal += line_total,
                ProductCategory::Clothing => clothing_subtotal += line_total,
            }
            validated.push((product, item.quantity));
        }

        let spans_both_groups =
            accessories_subtotal > Decimal::ZERO && clothing_subtotal > Decimal::ZERO;
        let shipment_mode = resolve_shipment_mode(request.shipment_preference, spans_both_groups);

        let shipping_cost = self.config.shipping_cost_for(subtotal);
        let discount = Decimal::ZERO;
        let total = subtotal + shipping_cost - discount;

        let now = Utc::now();
        let order_id = Uuid::new_v4();
        let order_model = order::ActiveModel {
            id: Set(order_id),
            order_number: Set(candidate),
            status: Set(OrderStatus::Pending),
            payment_status: Set(PaymentStatus::Pending),
            shipment_mode: Set(shipment_mode),
            subtotal: Set(subtotal),
            shipping_cost: Set(shipping_cost),
            discount: Set(discount),
            total: Set(total),
            currency: Set(self.config.currency.clone()),
            buyer_name: Set(request.buyer_name.clone()),
            buyer_email: Set(request.buyer_email.clone()),
            buyer_phone: Set(request.buyer_phone.clone()),
            shipping_address: Set(request.shipping_address.clone()),
            company_name: Set(request.company_name.clone()),
            tax_id: Set(request.tax_id.clone()),
            created_at: Set(now),
            paid_at: Set(None),
            shipped_at: Set(None),
            delivered_at: Set(None),
            cancelled_at: Set(None),
            updated_at: Set(Some(now)),
        }
        .insert(&txn)
        .await?;

        for (product, quantity) in &validated {
            order_line::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(product.id),
                name: Set(product.name.clone()),
                category: Set(product.category),
                unit_price: Set(product.unit_price),
                quantity: Set(*quantity),
                line_total: Set(product.unit_price * Decimal::from(*quantity)),
                created_at: Set(now),
            }
            .insert(&txn)
            .await?;
        }

        // Stock items ship first and carry the shipping charge (and any
        // discount) so partition totals sum to the order total.
        let partitions = match shipment_mode {
            ShipmentMode::Split => vec![
                partition_model(
                    order_id,
                    PartitionScope::Accessories,
                    accessories_subtotal,
                    shipping_cost,
                    discount,
                    now,
                ),
                partition_model(
                    order_id,
                    PartitionScope::Clothing,
                    clothing_subtotal,
                    Decimal::ZERO,
                    Decimal::ZERO,
                    now,
                ),
            ],
            _ => vec![partition_model(
                order_id,
                PartitionScope::Full,
                subtotal,
                shipping_cost,
                discount,
                now,
            )],
        };
        for partition in partitions {
            partition.insert(&txn).await?;
        }

        for (product, quantity) in &validated {
            inventory::reserve(&txn, product.id, *quantity, &product.name).await?;
        }

        cart_item::Entity::delete_many()
            .filter(cart_item::Column::CartRef.eq(request.cart_ref.clone()))
            .exec(&txn)
            .await?;

        txn.commit().await?;
        Ok(CreateAttempt::Created(order_model))
    }

    /// Cancels an order that has not yet shipped, restoring every reserved
    /// quantity to the inventory ledger in the same transaction.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn cancel_order(&self, order_id: Uuid) -> Result<OrderResponse, ServiceError> {
        let txn = self.db.begin().await?;

        let order = order::Entity::find_by_id(order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        if !order.status.is_cancellable() {
            return Err(ServiceError::OrderNotCancellable(format!(
                "Order {} cannot be cancelled in status {:?}",
                order.order_number, order.status
            )));
        }

        let lines = order.find_related(order_line::Entity).all(&txn).await?;
        for line in &lines {
            inventory::release(&txn, line.product_id, line.quantity).await?;
        }

        let previous_payment = order.payment_status;
        let next_payment = if previous_payment == PaymentStatus::Completed {
            PaymentStatus::Refunded
        } else {
            PaymentStatus::Cancelled
        };

        let now = Utc::now();
        let mut active: order::ActiveModel = order.into();
        active.status = Set(OrderStatus::Cancelled);
        active.payment_status = Set(next_payment);
        active.cancelled_at = Set(Some(now));
        active.updated_at = Set(Some(now));
        let updated = active.update(&txn).await?;

        // Close any open attempt so a stale session cannot resurrect the order.
        let open_attempts = payment_attempt::Entity::find()
            .filter(payment_attempt::Column::OrderId.eq(order_id))
            .filter(
                payment_attempt::Column::Status
                    .is_in([PaymentStatus::Pending, PaymentStatus::Processing]),
            )
            .all(&txn)
            .await?;
        for attempt in open_attempts {
            let mut active: payment_attempt::ActiveModel = attempt.into();
            active.status = Set(next_payment);
            active.updated_at = Set(Some(now));
            active.update(&txn).await?;
        }

        txn.commit().await?;

        info!(
            order_number = %updated.order_number,
            payment_status = ?next_payment,
            "Order cancelled; reserved stock restored"
        );
        if let Err(e) = self.event_sender.send(Event::OrderCancelled(order_id)).await {
            warn!(error = %e, "Failed to send order cancelled event");
        }
        if let Err(e) = self
            .event_sender
            .send(Event::PaymentStatusChanged {
                order_id,
                from: previous_payment,
                to: next_payment,
            })
            .await
        {
            warn!(error = %e, "Failed to send payment status event");
        }

        Ok(updated.into())
    }

    /// Order view with lines and billing partitions.
    pub async fn get_order(&self, order_id: Uuid) -> Result<OrderDetailResponse, ServiceError> {
        let order = order::Entity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        let lines = order
            .find_related(order_line::Entity)
            .all(&*self.db)
            .await?;
        let partitions = order
            .find_related(billing_partition::Entity)
            .all(&*self.db)
            .await?;

        Ok(OrderDetailResponse {
            order: order.into(),
            lines: lines
                .into_iter()
                .map(|line| OrderLineResponse {
                    product_id: line.product_id,
                    name: line.name,
                    category: line.category,
                    unit_price: line.unit_price,
                    quantity: line.quantity,
                    line_total: line.line_total,
                })
                .collect(),
            partitions: partitions
                .into_iter()
                .map(|p| PartitionResponse {
                    id: p.id,
                    scope: p.scope,
                    status: p.status,
                    subtotal: p.subtotal,
                    shipping_allocation: p.shipping_allocation,
                    discount_allocation: p.discount_allocation,
                    document_ref: p.document_ref,
                    issued_at: p.issued_at,
                })
                .collect(),
        })
    }

    /// Resolves an order reference that may be the UUID or the
    /// human-presentable order number.
    pub async fn find_by_reference(&self, reference: &str) -> Result<order::Model, ServiceError> {
        if let Ok(id) = Uuid::parse_str(reference) {
            if let Some(order) = order::Entity::find_by_id(id).one(&*self.db).await? {
                return Ok(order);
            }
        }
        order::Entity::find()
            .filter(order::Column::OrderNumber.eq(reference))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", reference)))
    }
}

fn partition_model(
    order_id: Uuid,
    scope: PartitionScope,
    subtotal: Decimal,
    shipping_allocation: Decimal,
    discount_allocation: Decimal,
    now: DateTime<Utc>,
) -> billing_partition::ActiveModel {
    billing_partition::ActiveModel {
        id: Set(Uuid::new_v4()),
        order_id: Set(order_id),
        scope: Set(scope),
        status: Set(PartitionStatus::Pending),
        subtotal: Set(subtotal),
        shipping_allocation: Set(shipping_allocation),
        discount_allocation: Set(discount_allocation),
        document_ref: Set(None),
        issued_at: Set(None),
        created_at: Set(now),
    }
}

/// A non-default shipment preference is honored only when the cart actually
/// spans both shipment-category groups.
fn resolve_shipment_mode(preference: Option<ShipmentMode>, spans_both_groups: bool) -> ShipmentMode {
    match preference {
        Some(mode) if mode != ShipmentMode::Standard && spans_both_groups => mode,
        _ => ShipmentMode::Standard,
    }
}
