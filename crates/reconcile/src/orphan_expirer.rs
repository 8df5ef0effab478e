//! Sweep for attempts that never reached the provider.
//!
//! A buyer can open checkout, reserve inventory, and walk away before the
//! invoice is even created. Those attempts hold stock hostage with no
//! webhook ever coming; past a short TTL they are canceled outright and
//! the reservation is released.

use std::sync::Arc;

use sqlx::PgPool;
use uuid::Uuid;

use crate::config::ReconcileConfig;
use crate::error::ReconcileResult;
use crate::inventory::{InventoryLedger, RestockReason};
use crate::orders::{OrderStore, Provider};

/// Counters for one sweep run.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrphanSweepSummary {
    pub scanned: usize,
    pub expired: usize,
    /// Guard did not match: the order moved on (e.g. a webhook landed
    /// between the candidate query and the cancel).
    pub skipped: usize,
    pub failed: usize,
}

pub struct OrphanExpirer {
    orders: OrderStore,
    ledger: Arc<dyn InventoryLedger>,
    config: ReconcileConfig,
}

impl OrphanExpirer {
    pub fn new(pool: PgPool, config: ReconcileConfig, ledger: Arc<dyn InventoryLedger>) -> Self {
        Self {
            orders: OrderStore::new(pool),
            ledger,
            config,
        }
    }

    pub async fn run(&self, worker_id: &str) -> ReconcileResult<OrphanSweepSummary> {
        let candidates = self
            .orders
            .orphan_candidates(self.config.orphan_ttl_secs, self.config.sweep_batch)
            .await?;

        let mut summary = OrphanSweepSummary {
            scanned: candidates.len(),
            ..Default::default()
        };

        for attempt in candidates {
            match self.expire_one(attempt.order_id, attempt.id, worker_id).await {
                Ok(true) => summary.expired += 1,
                Ok(false) => summary.skipped += 1,
                Err(e) => {
                    summary.failed += 1;
                    tracing::warn!(
                        attempt_id = %attempt.id,
                        order_id = %attempt.order_id,
                        error = %e,
                        "Orphan expiry failed; will retry next sweep"
                    );
                }
            }
        }

        tracing::info!(
            scanned = summary.scanned,
            expired = summary.expired,
            skipped = summary.skipped,
            failed = summary.failed,
            "Orphan-attempt sweep complete"
        );

        Ok(summary)
    }

    async fn expire_one(
        &self,
        order_id: Uuid,
        attempt_id: Uuid,
        worker_id: &str,
    ) -> ReconcileResult<bool> {
        let expired = self
            .orders
            .expire_orphan(order_id, attempt_id, Provider::Mono)
            .await?;

        if !expired {
            return Ok(false);
        }

        tracing::info!(
            order_id = %order_id,
            attempt_id = %attempt_id,
            "Expired orphaned attempt, order canceled"
        );

        if let Err(e) = self
            .ledger
            .restock_order(order_id, RestockReason::Canceled, worker_id)
            .await
        {
            tracing::error!(
                order_id = %order_id,
                error = %e,
                "Inventory release failed after orphan expiry"
            );
        }

        Ok(true)
    }
}
