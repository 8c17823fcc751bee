//! Inventory ledger access. These helpers run only inside a caller's
//! transaction: order creation pairs every decrement with the validated
//! reservation it just made, and cancellation restores exactly what was
//! reserved.

use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter};
use uuid::Uuid;

use crate::entities::inventory_record::{self, Entity as InventoryRecord};
use crate::errors::ServiceError;

/// Available quantity for a product; zero when no ledger row exists.
pub async fn available<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
) -> Result<i32, ServiceError> {
    Ok(InventoryRecord::find_by_id(product_id)
        .one(conn)
        .await?
        .map(|record| record.available)
        .unwrap_or(0))
}

/// Decrements a product's available quantity. The update is guarded by
/// `available >= quantity`, so two transactions racing for the last unit
/// cannot both succeed; the loser sees the guard miss and aborts its
/// transaction with `INSUFFICIENT_STOCK`.
pub async fn reserve<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
    quantity: i32,
    product_name: &str,
) -> Result<(), ServiceError> {
    let result = InventoryRecord::update_many()
        .col_expr(
            inventory_record::Column::Available,
            Expr::col(inventory_record::Column::Available).sub(quantity),
        )
        .col_expr(inventory_record::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(inventory_record::Column::ProductId.eq(product_id))
        .filter(inventory_record::Column::Available.gte(quantity))
        .exec(conn)
        .await?;

    if result.rows_affected == 0 {
        return Err(ServiceError::InsufficientStock(product_name.to_string()));
    }
    Ok(())
}

/// Returns a cancelled order's reserved quantity to the ledger.
pub async fn release<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
    quantity: i32,
) -> Result<(), ServiceError> {
    let result = InventoryRecord::update_many()
        .col_expr(
            inventory_record::Column::Available,
            Expr::col(inventory_record::Column::Available).add(quantity),
        )
        .col_expr(inventory_record::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(inventory_record::Column::ProductId.eq(product_id))
        .exec(conn)
        .await?;

    if result.rows_affected == 0 {
        return Err(ServiceError::InternalError(format!(
            "missing inventory record for product {product_id}"
        )));
    }
    Ok(())
}
