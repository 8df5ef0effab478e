//! Lease-based exclusive processing.
//!
//! The only exclusion mechanism in the engine: a single conditional UPDATE
//! that takes the lease where none is held or the previous one expired. The
//! `rows_affected` count is the race verdict. Worker identity is always an
//! explicit argument; release is guarded by it so a worker can never free a
//! lease that was stolen from it after expiry.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::ReconcileResult;

pub struct ClaimCoordinator {
    pool: PgPool,
}

impl ClaimCoordinator {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Take the lease on a webhook event row. Returns whether we won.
    /// Claiming a row we already hold renews the lease.
    pub async fn claim_event(
        &self,
        event_id: Uuid,
        worker_id: &str,
        ttl_secs: i64,
    ) -> ReconcileResult<bool> {
        let rows = sqlx::query(
            r#"
            UPDATE webhook_events
            SET claimed_at = NOW(),
                claim_expires_at = NOW() + ($2 || ' seconds')::INTERVAL,
                claimed_by = $3
            WHERE id = $1
              AND (claim_expires_at IS NULL OR claim_expires_at < NOW() OR claimed_by = $3)
            "#,
        )
        .bind(event_id)
        .bind(ttl_secs)
        .bind(worker_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows > 0)
    }

    /// Release an event lease we still hold.
    pub async fn release_event(&self, event_id: Uuid, worker_id: &str) -> ReconcileResult<bool> {
        let rows = sqlx::query(
            r#"
            UPDATE webhook_events
            SET claimed_at = NULL, claim_expires_at = NULL, claimed_by = NULL
            WHERE id = $1 AND claimed_by = $2
            "#,
        )
        .bind(event_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows > 0)
    }

    /// Take the lease on a payment attempt. Returns whether we won.
    /// Claiming a row we already hold renews the lease.
    pub async fn claim_attempt(
        &self,
        attempt_id: Uuid,
        worker_id: &str,
        ttl_secs: i64,
    ) -> ReconcileResult<bool> {
        let rows = sqlx::query(
            r#"
            UPDATE payment_attempts
            SET claimed_until = NOW() + ($2 || ' seconds')::INTERVAL,
                claimed_by = $3,
                updated_at = NOW()
            WHERE id = $1
              AND (claimed_until IS NULL OR claimed_until < NOW() OR claimed_by = $3)
            "#,
        )
        .bind(attempt_id)
        .bind(ttl_secs)
        .bind(worker_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows > 0)
    }

    /// Release an attempt lease we still hold.
    pub async fn release_attempt(
        &self,
        attempt_id: Uuid,
        worker_id: &str,
    ) -> ReconcileResult<bool> {
        let rows = sqlx::query(
            r#"
            UPDATE payment_attempts
            SET claimed_until = NULL, claimed_by = NULL, updated_at = NOW()
            WHERE id = $1 AND claimed_by = $2
            "#,
        )
        .bind(attempt_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows > 0)
    }
}
