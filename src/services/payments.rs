use std::sync::Arc;

use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, ModelTrait, PaginatorTrait,
    QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    clients::payment_gateway::{CreateSessionRequest, GatewayLineItem, PaymentGateway},
    entities::{
        billing_partition, order, order_line, payment_attempt, OrderStatus, PartitionStatus,
        PaymentStatus,
    },
    errors::ServiceError,
    events::{Event, EventSender},
};

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CheckoutRedirect {
    pub order_number: String,
    pub session_id: String,
    /// Where to send the buyer to complete payment
    pub redirect_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PaymentStatusResponse {
    pub order_number: String,
    pub payment_status: PaymentStatus,
    pub total: Decimal,
    pub currency: String,
}

/// An inbound gateway notification, normalized by the webhook handler (or
/// synthesized by the status poll fallback).
#[derive(Debug, Clone)]
pub struct GatewayNotification {
    pub session_id: Option<String>,
    pub order_number: Option<String>,
    pub status: String,
    pub payload: serde_json::Value,
    pub signature_valid: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// No matching order: the notification may be stale, duplicated, or
    /// early; acknowledged without side effects.
    NoMatch,
    /// Matched but did not advance the state machine (replay or stale
    /// status); the raw payload was still recorded.
    Unchanged {
        order_id: Uuid,
        status: PaymentStatus,
    },
    Transitioned {
        order_id: Uuid,
        from: PaymentStatus,
        to: PaymentStatus,
    },
}

/// Owns the payment session lifecycle and all payment-status mutation of
/// orders (the cancellation path aside).
#[derive(Clone)]
pub struct PaymentService {
    db: Arc<DatabaseConnection>,
    gateway: Arc<dyn PaymentGateway>,
    event_sender: EventSender,
}

impl PaymentService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        gateway: Arc<dyn PaymentGateway>,
        event_sender: EventSender,
    ) -> Self {
        Self {
            db,
            gateway,
            event_sender,
        }
    }

    /// Opens a payment session with the gateway for an existing order, or
    /// returns the already-open session so retries never create a duplicate.
    /// The gateway call happens outside any database transaction; if it
    /// fails, the order stays pending/pending and the caller can retry.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn create_session(&self, order_id: Uuid) -> Result<CheckoutRedirect, ServiceError> {
        let order = order::Entity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        if order.payment_status.is_terminal() {
            return Err(ServiceError::InvalidOperation(format!(
                "Payment for order {} is already {:?}",
                order.order_number, order.payment_status
            )));
        }

        let open_attempt = payment_attempt::Entity::find()
            .filter(payment_attempt::Column::OrderId.eq(order_id))
            .filter(
                payment_attempt::Column::Status
                    .is_in([PaymentStatus::Pending, PaymentStatus::Processing]),
            )
            .order_by_desc(payment_attempt::Column::CreatedAt)
            .one(&*self.db)
            .await?;
        if let Some(attempt) = open_attempt {
            if let (Some(session_id), Some(redirect_url)) =
                (attempt.session_id.clone(), attempt.redirect_url.clone())
            {
                debug!(session_id = %session_id, "Reusing open payment session");
                return Ok(CheckoutRedirect {
                    order_number: order.order_number,
                    session_id,
                    redirect_url,
                });
            }
        }

        let lines = order.find_related(order_line::Entity).all(&*self.db).await?;
        let request = CreateSessionRequest {
            reference: order.order_number.clone(),
            amount: to_minor_units(order.total)?,
            currency: order.currency.clone(),
            buyer_name: order.buyer_name.clone(),
            buyer_email: order.buyer_email.clone(),
            line_items: lines
                .iter()
                .map(|line| {
                    Ok(GatewayLineItem {
                        name: line.name.clone(),
                        quantity: line.quantity,
                        unit_amount: to_minor_units(line.unit_price)?,
                    })
                })
                .collect::<Result<Vec<_>, ServiceError>>()?,
        };

        let session = self.gateway.create_session(&request).await?;

        let now = Utc::now();
        payment_attempt::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            session_id: Set(Some(session.session_id.clone())),
            redirect_url: Set(Some(session.redirect_url.clone())),
            amount: Set(order.total),
            currency: Set(order.currency.clone()),
            status: Set(PaymentStatus::Pending),
            last_payload: Set(None),
            signature_flagged: Set(false),
            created_at: Set(now),
            updated_at: Set(Some(now)),
        }
        .insert(&*self.db)
        .await?;

        info!(
            order_number = %order.order_number,
            session_id = %session.session_id,
            "Payment session opened"
        );

        Ok(CheckoutRedirect {
            order_number: order.order_number,
            session_id: session.session_id,
            redirect_url: session.redirect_url,
        })
    }

    /// Applies one gateway notification idempotently. Safe under arbitrary
    /// replay and reordering: the raw payload is recorded for audit on every
    /// delivery, but the order only moves forward through the state machine.
    #[instrument(skip(self, notification), fields(status = %notification.status))]
    pub async fn apply_notification(
        &self,
        notification: GatewayNotification,
    ) -> Result<ReconcileOutcome, ServiceError> {
        let txn = self.db.begin().await?;

        let attempt_by_session = match &notification.session_id {
            Some(session_id) => {
                payment_attempt::Entity::find()
                    .filter(payment_attempt::Column::SessionId.eq(session_id.clone()))
                    .one(&txn)
                    .await?
            }
            None => None,
        };

        let (order, attempt) = match attempt_by_session {
            Some(found) => {
                let order = order::Entity::find_by_id(found.order_id)
                    .one(&txn)
                    .await?
                    .ok_or_else(|| {
                        ServiceError::InternalError(format!(
                            "payment attempt {} references a missing order",
                            found.id
                        ))
                    })?;
                (order, Some(found))
            }
            None => {
                let Some(number) = &notification.order_number else {
                    debug!("Notification carries no resolvable reference; acknowledging");
                    return Ok(ReconcileOutcome::NoMatch);
                };
                match order::Entity::find()
                    .filter(order::Column::OrderNumber.eq(number.clone()))
                    .one(&txn)
                    .await?
                {
                    Some(found) => {
                        let latest = found
                            .find_related(payment_attempt::Entity)
                            .order_by_desc(payment_attempt::Column::CreatedAt)
                            .one(&txn)
                            .await?;
                        (found, latest)
                    }
                    None => {
                        debug!(
                            order_number = %number,
                            "No matching order for notification; acknowledging"
                        );
                        return Ok(ReconcileOutcome::NoMatch);
                    }
                }
            }
        };

        // Audit trail: the raw payload lands on the attempt whether or not
        // it changes state. A notification for an order without any attempt
        // row still gets one, so nothing is lost.
        let now = Utc::now();
        let attempt = match attempt {
            Some(existing) => {
                let flagged = existing.signature_flagged || !notification.signature_valid;
                let mut active: payment_attempt::ActiveModel = existing.into();
                active.last_payload = Set(Some(notification.payload.clone()));
                active.signature_flagged = Set(flagged);
                active.updated_at = Set(Some(now));
                active.update(&txn).await?
            }
            None => {
                payment_attempt::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    order_id: Set(order.id),
                    session_id: Set(notification.session_id.clone()),
                    redirect_url: Set(None),
                    amount: Set(order.total),
                    currency: Set(order.currency.clone()),
                    status: Set(order.payment_status),
                    last_payload: Set(Some(notification.payload.clone())),
                    signature_flagged: Set(!notification.signature_valid),
                    created_at: Set(now),
                    updated_at: Set(Some(now)),
                }
                .insert(&txn)
                .await?
            }
        };

        let mapped = map_gateway_status(&notification.status);
        let current = order.payment_status;
        if !transition_allowed(current, mapped) {
            txn.commit().await?;
            debug!(
                order_id = %order.id,
                current = ?current,
                reported = ?mapped,
                "Notification did not advance payment state; acknowledged"
            );
            return Ok(ReconcileOutcome::Unchanged {
                order_id: order.id,
                status: current,
            });
        }

        let order_id = order.id;
        let order_number = order.order_number.clone();
        let mut order_active: order::ActiveModel = order.into();
        order_active.payment_status = Set(mapped);
        if mapped == PaymentStatus::Completed {
            // First transition into completed: stamp the payment timestamp
            // once and confirm the order.
            order_active.status = Set(OrderStatus::Confirmed);
            order_active.paid_at = Set(Some(now));
        }
        order_active.updated_at = Set(Some(now));
        order_active.update(&txn).await?;

        let mut attempt_active: payment_attempt::ActiveModel = attempt.into();
        attempt_active.status = Set(mapped);
        attempt_active.updated_at = Set(Some(now));
        attempt_active.update(&txn).await?;

        txn.commit().await?;

        info!(
            order_number = %order_number,
            from = ?current,
            to = ?mapped,
            "Payment status reconciled"
        );
        if let Err(e) = self
            .event_sender
            .send(Event::PaymentStatusChanged {
                order_id,
                from: current,
                to: mapped,
            })
            .await
        {
            warn!(error = %e, "Failed to send payment status event");
        }
        if mapped == PaymentStatus::Completed {
            if let Err(e) = self
                .event_sender
                .send(Event::PaymentCompleted(order_id))
                .await
            {
                warn!(error = %e, "Failed to send payment completed event");
            }
        }

        Ok(ReconcileOutcome::Transitioned {
            order_id,
            from: current,
            to: mapped,
        })
    }

    /// Current payment state for an order. While the stored status is
    /// non-terminal this polls the gateway once as a fallback for lost
    /// webhooks; a poll failure is tolerated and the stored status returned.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn payment_status(
        &self,
        order_id: Uuid,
    ) -> Result<PaymentStatusResponse, ServiceError> {
        let mut order = order::Entity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        if !order.payment_status.is_terminal() {
            let latest_with_session = payment_attempt::Entity::find()
                .filter(payment_attempt::Column::OrderId.eq(order_id))
                .filter(payment_attempt::Column::SessionId.is_not_null())
                .order_by_desc(payment_attempt::Column::CreatedAt)
                .one(&*self.db)
                .await?;

            if let Some(session_id) = latest_with_session.and_then(|a| a.session_id) {
                match self.gateway.fetch_status(&session_id).await {
                    Ok(reported) => {
                        if map_gateway_status(&reported.status).is_terminal() {
                            self.apply_notification(GatewayNotification {
                                session_id: Some(session_id),
                                order_number: Some(order.order_number.clone()),
                                status: reported.status.clone(),
                                payload: json!({
                                    "source": "status_poll",
                                    "status": reported.status,
                                }),
                                signature_valid: true,
                            })
                            .await?;

                            order = order::Entity::find_by_id(order_id)
                                .one(&*self.db)
                                .await?
                                .ok_or_else(|| {
                                    ServiceError::NotFound(format!("Order {} not found", order_id))
                                })?;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Gateway status poll failed; returning stored status");
                    }
                }
            }
        }

        // A completed payment with partitions still pending means an earlier
        // issuance attempt failed; trigger a retry through the event worker.
        if order.payment_status == PaymentStatus::Completed {
            let pending = billing_partition::Entity::find()
                .filter(billing_partition::Column::OrderId.eq(order_id))
                .filter(billing_partition::Column::Status.eq(PartitionStatus::Pending))
                .count(&*self.db)
                .await?;
            if pending > 0 {
                if let Err(e) = self
                    .event_sender
                    .send(Event::PaymentCompleted(order_id))
                    .await
                {
                    warn!(error = %e, "Failed to send billing retry event");
                }
            }
        }

        Ok(PaymentStatusResponse {
            order_number: order.order_number,
            payment_status: order.payment_status,
            total: order.total,
            currency: order.currency,
        })
    }
}

/// Fixed lookup from the gateway's reported status strings to the internal
/// enumeration. Unrecognized values map to `Processing` rather than being
/// dropped, so an unexpected gateway vocabulary change degrades to a
/// non-terminal state instead of losing the notification.
pub fn map_gateway_status(raw: &str) -> PaymentStatus {
    match raw.to_ascii_uppercase().as_str() {
        "CREATED" | "OPEN" | "PENDING" => PaymentStatus::Pending,
        "PROCESSING" | "AUTHORIZED" | "PENDING_CAPTURE" => PaymentStatus::Processing,
        "COMPLETED" | "PAID" | "SUCCEEDED" => PaymentStatus::Completed,
        "FAILED" | "DECLINED" | "ERROR" => PaymentStatus::Failed,
        "CANCELLED" | "CANCELED" | "EXPIRED" => PaymentStatus::Cancelled,
        "REFUNDED" | "CHARGED_BACK" => PaymentStatus::Refunded,
        other => {
            warn!(
                gateway_status = other,
                "Unrecognized gateway status; treating as processing"
            );
            PaymentStatus::Processing
        }
    }
}

/// Monotonic state machine over payment status. Terminal statuses never
/// regress; `Refunded` is reachable only from `Completed` via an explicit
/// refund event, never by webhook reordering.
fn transition_allowed(current: PaymentStatus, next: PaymentStatus) -> bool {
    use PaymentStatus::*;
    match (current, next) {
        (Pending, Processing | Completed | Failed | Cancelled) => true,
        (Processing, Completed | Failed | Cancelled) => true,
        (Completed, Refunded) => true,
        _ => false,
    }
}

/// Converts a decimal amount to the gateway's smallest currency unit.
fn to_minor_units(amount: Decimal) -> Result<i64, ServiceError> {
    (amount * Decimal::from(100))
        .round()
        .to_i64()
        .ok_or_else(|| ServiceError::InternalError(format!("amount {amount} out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn known_gateway_statuses_map_exhaustively() {
        assert_eq!(map_gateway_status("PAID"), PaymentStatus::Completed);
        assert_eq!(map_gateway_status("completed"), PaymentStatus::Completed);
        assert_eq!(map_gateway_status("DECLINED"), PaymentStatus::Failed);
        assert_eq!(map_gateway_status("EXPIRED"), PaymentStatus::Cancelled);
        assert_eq!(map_gateway_status("REFUNDED"), PaymentStatus::Refunded);
        assert_eq!(map_gateway_status("open"), PaymentStatus::Pending);
    }

    #[test]
    fn unknown_gateway_status_falls_back_to_processing() {
        assert_eq!(
            map_gateway_status("SOMETHING_NEW"),
            PaymentStatus::Processing
        );
    }

    #[test]
    fn terminal_statuses_never_regress() {
        use PaymentStatus::*;
        assert!(!transition_allowed(Completed, Processing));
        assert!(!transition_allowed(Completed, Pending));
        assert!(!transition_allowed(Completed, Completed));
        assert!(!transition_allowed(Failed, Completed));
        assert!(!transition_allowed(Cancelled, Processing));
        assert!(!transition_allowed(Refunded, Completed));
    }

    #[test]
    fn forward_transitions_are_allowed() {
        use PaymentStatus::*;
        assert!(transition_allowed(Pending, Processing));
        assert!(transition_allowed(Pending, Completed));
        assert!(transition_allowed(Processing, Completed));
        assert!(transition_allowed(Processing, Failed));
        assert!(transition_allowed(Completed, Refunded));
    }

    #[test]
    fn refund_is_not_reachable_from_non_terminal_states() {
        use PaymentStatus::*;
        assert!(!transition_allowed(Pending, Refunded));
        assert!(!transition_allowed(Processing, Refunded));
    }

    #[test]
    fn minor_unit_conversion_rounds_sub_cent_amounts() {
        assert_eq!(to_minor_units(dec!(35.00)).unwrap(), 3500);
        assert_eq!(to_minor_units(dec!(0.99)).unwrap(), 99);
        assert_eq!(to_minor_units(dec!(10.006)).unwrap(), 1001);
    }
}
