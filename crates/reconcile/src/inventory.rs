//! Reserved-inventory release.
//!
//! The move ledger itself belongs to the inventory service; this engine
//! only ever asks it to "release for order X, reason Y" and relies on the
//! ledger's unique key to no-op on repeats. The Postgres adapter here is
//! the production binding of that contract.

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::ReconcileResult;

/// Why reserved stock is going back on the shelf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestockReason {
    Failed,
    Refunded,
    Canceled,
    Stale,
}

impl RestockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestockReason::Failed => "failed",
            RestockReason::Refunded => "refunded",
            RestockReason::Canceled => "canceled",
            RestockReason::Stale => "stale",
        }
    }
}

impl std::fmt::Display for RestockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Seam to the external inventory ledger. Implementations must be
/// idempotent per order: a second release is a no-op, never a double
/// restock.
#[async_trait]
pub trait InventoryLedger: Send + Sync {
    async fn restock_order(
        &self,
        order_id: Uuid,
        reason: RestockReason,
        worker_id: &str,
    ) -> ReconcileResult<()>;
}

pub struct PgInventoryLedger {
    pool: PgPool,
}

impl PgInventoryLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InventoryLedger for PgInventoryLedger {
    async fn restock_order(
        &self,
        order_id: Uuid,
        reason: RestockReason,
        worker_id: &str,
    ) -> ReconcileResult<()> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO inventory_moves (id, order_id, direction, reason, moved_by, created_at)
            VALUES ($1, $2, 'release', $3, $4, NOW())
            ON CONFLICT (order_id, direction) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(order_id)
        .bind(reason.as_str())
        .bind(worker_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        sqlx::query(
            r#"
            UPDATE orders
            SET inventory_status = 'released',
                stock_restored = TRUE,
                stock_restored_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND stock_restored = FALSE
            "#,
        )
        .bind(order_id)
        .execute(&self.pool)
        .await?;

        if inserted > 0 {
            tracing::info!(
                order_id = %order_id,
                reason = %reason,
                worker_id = %worker_id,
                "Released reserved inventory"
            );
        }

        Ok(())
    }
}
