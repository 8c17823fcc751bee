use std::sync::Arc;

use chrono::Utc;
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, ModelTrait, Set};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    clients::billing_provider::{
        BillingProvider, DocumentBuyer, DocumentLine, IssueDocumentRequest,
    },
    entities::{
        billing_partition, order, order_line, PartitionScope, PartitionStatus, PaymentStatus,
        ProductCategory,
    },
    errors::ServiceError,
};

/// What happened to one partition during an issuance pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssueOutcome {
    Issued(String),
    AlreadyIssued,
    /// Provider failure; the partition stays pending and is retried on the
    /// next trigger.
    Deferred,
}

/// Requests billing documents for a confirmed order's partitions. Issuance
/// is a best-effort side effect of payment confirmation: failures are logged
/// and retried later, never propagated into the payment state.
#[derive(Clone)]
pub struct BillingService {
    db: Arc<DatabaseConnection>,
    provider: Arc<dyn BillingProvider>,
}

impl BillingService {
    pub fn new(db: Arc<DatabaseConnection>, provider: Arc<dyn BillingProvider>) -> Self {
        Self { db, provider }
    }

    /// Issues a document for every pending partition of the order. Already
    /// issued partitions are skipped, so replayed triggers are harmless.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn issue_documents(&self, order_id: Uuid) -> Result<Vec<IssueOutcome>, ServiceError> {
        let order = order::Entity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        if order.payment_status != PaymentStatus::Completed {
            return Err(ServiceError::InvalidOperation(format!(
                "Payment for order {} is {:?}, not completed",
                order.order_number, order.payment_status
            )));
        }

        let partitions = order
            .find_related(billing_partition::Entity)
            .all(&*self.db)
            .await?;

        let mut outcomes = Vec::with_capacity(partitions.len());
        for partition in &partitions {
            outcomes.push(self.issue_partition(&order, partition).await?);
        }
        Ok(outcomes)
    }

    /// Issues exactly one document for a partition, or reports "already
    /// issued" without side effects.
    #[instrument(skip(self, order, partition), fields(order_number = %order.order_number, scope = ?partition.scope))]
    pub async fn issue_partition(
        &self,
        order: &order::Model,
        partition: &billing_partition::Model,
    ) -> Result<IssueOutcome, ServiceError> {
        if partition.status == PartitionStatus::Issued {
            return Ok(IssueOutcome::AlreadyIssued);
        }

        let all_lines = order.find_related(order_line::Entity).all(&*self.db).await?;
        let lines: Vec<_> = all_lines
            .into_iter()
            .filter(|line| line_in_scope(partition.scope, line.category))
            .collect();

        let request = IssueDocumentRequest {
            order_number: order.order_number.clone(),
            scope: scope_label(partition.scope).to_string(),
            buyer: DocumentBuyer {
                name: order.buyer_name.clone(),
                company_name: order.company_name.clone(),
                tax_id: order.tax_id.clone(),
                email: order.buyer_email.clone(),
                address: order.shipping_address.clone(),
            },
            lines: lines
                .iter()
                .map(|line| DocumentLine {
                    description: line.name.clone(),
                    quantity: line.quantity,
                    unit_price: line.unit_price,
                    line_total: line.line_total,
                })
                .collect(),
            shipping: partition.shipping_allocation,
            discount: partition.discount_allocation,
            total: partition.document_total(),
            currency: order.currency.clone(),
        };

        match self.provider.issue_document(&request).await {
            Ok(document) => {
                let now = Utc::now();
                let mut active: billing_partition::ActiveModel = partition.clone().into();
                active.status = Set(PartitionStatus::Issued);
                active.document_ref = Set(Some(document.document_ref.clone()));
                active.issued_at = Set(Some(now));
                active.update(&*self.db).await?;

                info!(
                    document_ref = %document.document_ref,
                    total = %request.total,
                    "Billing document issued"
                );
                Ok(IssueOutcome::Issued(document.document_ref))
            }
            Err(e) => {
                warn!(
                    error = %e,
                    "Billing document issuance failed; partition left pending"
                );
                Ok(IssueOutcome::Deferred)
            }
        }
    }
}

fn scope_label(scope: PartitionScope) -> &'static str {
    match scope {
        PartitionScope::Full => "full",
        PartitionScope::Accessories => "accessories",
        PartitionScope::Clothing => "clothing",
    }
}

fn line_in_scope(scope: PartitionScope, category: ProductCategory) -> bool {
    match scope {
        PartitionScope::Full => true,
        PartitionScope::Accessories => category == ProductCategory::Accessories,
        PartitionScope::Clothing => category == ProductCategory::Clothing,
    }
}
