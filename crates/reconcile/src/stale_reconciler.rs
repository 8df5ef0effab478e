//! Sweep for attempts stuck in a non-terminal state.
//!
//! Webhooks get lost. An attempt that has sat in `creating`/`active` with a
//! provider invoice past the grace window gets its status pulled from the
//! provider directly; the response is synthesized into a normal event and
//! driven through the same apply machine as live traffic, so the sweep can
//! never disagree with the webhook path about what a status means.

use std::sync::Arc;

use sqlx::PgPool;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::apply::WebhookApplier;
use crate::claims::ClaimCoordinator;
use crate::config::ReconcileConfig;
use crate::error::ReconcileResult;
use crate::events::{AppliedResult, EventStore};
use crate::inventory::{InventoryLedger, RestockReason};
use crate::orders::{OrderStore, PaymentAttemptRow};
use crate::provider::ProviderApi;

/// Counters for one sweep run.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaleSweepSummary {
    pub scanned: usize,
    pub applied: usize,
    pub noop: usize,
    pub failed: usize,
}

pub struct StaleActiveReconciler {
    orders: OrderStore,
    claims: ClaimCoordinator,
    events: EventStore,
    applier: WebhookApplier,
    provider: Arc<dyn ProviderApi>,
    ledger: Arc<dyn InventoryLedger>,
    config: ReconcileConfig,
}

impl StaleActiveReconciler {
    pub fn new(
        pool: PgPool,
        config: ReconcileConfig,
        provider: Arc<dyn ProviderApi>,
        ledger: Arc<dyn InventoryLedger>,
    ) -> Self {
        Self {
            orders: OrderStore::new(pool.clone()),
            claims: ClaimCoordinator::new(pool.clone()),
            events: EventStore::new(pool.clone()),
            applier: WebhookApplier::new(pool, config.lease_secs),
            provider,
            ledger,
            config,
        }
    }

    pub async fn run(&self, worker_id: &str) -> ReconcileResult<StaleSweepSummary> {
        let candidates = self
            .orders
            .stale_active_candidates(self.config.stale_grace_secs, self.config.sweep_batch)
            .await?;

        let mut summary = StaleSweepSummary {
            scanned: candidates.len(),
            ..Default::default()
        };

        for attempt in candidates {
            if !self
                .claims
                .claim_attempt(attempt.id, worker_id, self.config.lease_secs)
                .await?
            {
                summary.noop += 1;
                continue;
            }

            match self.reconcile_one(&attempt, worker_id).await {
                Ok(AppliedResult::Applied) => summary.applied += 1,
                Ok(_) => summary.noop += 1,
                Err(e) => {
                    summary.failed += 1;
                    tracing::warn!(
                        attempt_id = %attempt.id,
                        order_id = %attempt.order_id,
                        error = %e,
                        "Stale-attempt reconciliation failed; will retry next sweep"
                    );
                }
            }

            // The lease is released no matter what happened above; a failed
            // release just means waiting out the TTL.
            match self.claims.release_attempt(attempt.id, worker_id).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(attempt_id = %attempt.id, "Attempt lease was no longer ours to release");
                }
                Err(e) => {
                    tracing::warn!(attempt_id = %attempt.id, error = %e, "Failed to release attempt lease");
                }
            }
        }

        tracing::info!(
            scanned = summary.scanned,
            applied = summary.applied,
            noop = summary.noop,
            failed = summary.failed,
            "Stale-attempt sweep complete"
        );

        Ok(summary)
    }

    async fn reconcile_one(
        &self,
        attempt: &PaymentAttemptRow,
        worker_id: &str,
    ) -> ReconcileResult<AppliedResult> {
        let invoice_ref = attempt
            .provider_invoice_ref
            .as_deref()
            .unwrap_or_default();
        let state = self.provider.invoice_status(invoice_ref).await?;

        let payload = synthesize_payload(&state.raw, &state.invoice_ref, &state.status, attempt);
        let ingest = self.events.ingest(&payload).await?;
        if ingest.deduped {
            // The provider reported nothing we have not already recorded.
            return Ok(AppliedResult::Deduped);
        }

        let outcome = self
            .applier
            .apply(&ingest.event, &ingest.normalized, worker_id)
            .await?;

        if let (Some(_), Some(order_id)) = (outcome.restock, outcome.order_id) {
            if let Err(e) = self
                .ledger
                .restock_order(order_id, RestockReason::Stale, worker_id)
                .await
            {
                tracing::error!(
                    order_id = %order_id,
                    error = %e,
                    "Inventory release failed after stale-attempt reconciliation"
                );
            }
        }

        Ok(outcome.result)
    }
}

/// Turn a provider status response into a payload the normal ingest path
/// accepts. The merchant reference pins resolution to this very attempt,
/// and a missing modification time falls back to now so the freshest poll
/// can win the ordering guard.
fn synthesize_payload(
    raw: &serde_json::Value,
    invoice_ref: &str,
    status: &str,
    attempt: &PaymentAttemptRow,
) -> serde_json::Value {
    let mut payload = if raw.is_object() {
        raw.clone()
    } else {
        serde_json::json!({})
    };
    let Some(map) = payload.as_object_mut() else {
        return payload;
    };

    map.insert(
        "invoiceId".to_string(),
        serde_json::Value::String(invoice_ref.to_string()),
    );
    map.insert(
        "status".to_string(),
        serde_json::Value::String(status.to_string()),
    );
    map.entry("reference")
        .or_insert_with(|| serde_json::Value::String(attempt.id.to_string()));

    let has_timestamp = ["modifiedDate", "modified_date", "modifiedAt"]
        .iter()
        .any(|name| map.contains_key(*name));
    if !has_timestamp {
        if let Ok(now) = OffsetDateTime::now_utc().format(&Rfc3339) {
            map.insert("modifiedDate".to_string(), serde_json::Value::String(now));
        }
    }

    payload
}
