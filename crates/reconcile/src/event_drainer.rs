//! Replay of buffered webhook events.
//!
//! Deployments in `store` mode buffer deliveries instead of applying them
//! inline; this sweep claims the backlog and replays it through the same
//! apply machine. Claiming is unordered, so the claimed batch is reordered
//! into provider-causal order first: grouped by invoice, each group sorted
//! by the provider's own modification clock.
//!
//! Running against a non-`store` deployment would re-apply events that the
//! live path already handled, so construction refuses outright.

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::PgPool;
use uuid::Uuid;

use crate::apply::WebhookApplier;
use crate::claims::ClaimCoordinator;
use crate::config::{ReconcileConfig, WebhookMode};
use crate::error::{IssueCode, ReconcileError, ReconcileResult};
use crate::events::{AppliedResult, EventStore, WebhookEventRow};
use crate::inventory::InventoryLedger;
use crate::payload;

/// Counters for one drain run.
#[derive(Debug, Clone, Copy, Default)]
pub struct DrainSummary {
    pub claimed: usize,
    pub applied: usize,
    pub noop: usize,
    pub issues: usize,
}

pub struct StoredEventDrainer {
    events: EventStore,
    claims: ClaimCoordinator,
    applier: WebhookApplier,
    ledger: Arc<dyn InventoryLedger>,
    config: ReconcileConfig,
}

impl StoredEventDrainer {
    /// Fails with `ModeMismatch` unless the deployment buffers events.
    pub fn new(
        pool: PgPool,
        config: ReconcileConfig,
        ledger: Arc<dyn InventoryLedger>,
    ) -> ReconcileResult<Self> {
        if config.mode != WebhookMode::Store {
            return Err(ReconcileError::ModeMismatch(config.mode.to_string()));
        }

        Ok(Self {
            events: EventStore::new(pool.clone()),
            claims: ClaimCoordinator::new(pool.clone()),
            applier: WebhookApplier::new(pool, config.lease_secs),
            ledger,
            config,
        })
    }

    pub async fn run(&self, worker_id: &str) -> ReconcileResult<DrainSummary> {
        let candidates = self.events.stored_candidates(self.config.sweep_batch).await?;

        let mut claimed = Vec::with_capacity(candidates.len());
        for event in candidates {
            if self
                .claims
                .claim_event(event.id, worker_id, self.config.lease_secs)
                .await?
            {
                claimed.push(event);
            }
        }

        let mut summary = DrainSummary {
            claimed: claimed.len(),
            ..Default::default()
        };

        for event in order_canonically(claimed) {
            match self.replay_one(&event, worker_id).await {
                Ok(AppliedResult::Applied) => summary.applied += 1,
                Ok(AppliedResult::AppliedWithIssue | AppliedResult::Unmatched) => {
                    summary.issues += 1
                }
                Ok(_) => summary.noop += 1,
                Err(e) => {
                    // A broken event must not wedge the backlog: record the
                    // failure on the row and move on.
                    summary.issues += 1;
                    tracing::error!(
                        event_id = %event.id,
                        invoice_ref = %event.invoice_ref,
                        error = %e,
                        "Stored-event replay failed; event marked and skipped"
                    );
                    let message = e.to_string();
                    self.events
                        .mark_outcome(
                            event.id,
                            AppliedResult::AppliedWithIssue,
                            Some(IssueCode::DrainApplyFailed),
                            Some(message.as_str()),
                            event.attempt_id,
                            event.order_id,
                        )
                        .await?;
                }
            }

            match self.claims.release_event(event.id, worker_id).await {
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(event_id = %event.id, error = %e, "Failed to release event claim");
                }
            }
        }

        tracing::info!(
            claimed = summary.claimed,
            applied = summary.applied,
            noop = summary.noop,
            issues = summary.issues,
            "Stored-event drain complete"
        );

        Ok(summary)
    }

    async fn replay_one(
        &self,
        event: &WebhookEventRow,
        worker_id: &str,
    ) -> ReconcileResult<AppliedResult> {
        let normalized = payload::normalize(&event.payload)?;
        let outcome = self.applier.apply(event, &normalized, worker_id).await?;

        if let (Some(reason), Some(order_id)) = (outcome.restock, outcome.order_id) {
            if let Err(e) = self.ledger.restock_order(order_id, reason, worker_id).await {
                tracing::error!(
                    order_id = %order_id,
                    error = %e,
                    "Inventory release failed after stored-event replay"
                );
            }
        }

        Ok(outcome.result)
    }
}

/// Provider-causal ordering for a claimed batch.
///
/// Events are grouped by invoice reference (falling back to the linked
/// attempt, falling back to the event's own id as a singleton group). Group
/// members sort by (provider clock, received time, id); groups sort the
/// same way by their first member.
pub fn order_canonically(events: Vec<WebhookEventRow>) -> Vec<WebhookEventRow> {
    let mut groups: HashMap<String, Vec<WebhookEventRow>> = HashMap::new();
    for event in events {
        let key = group_key(&event);
        groups.entry(key).or_default().push(event);
    }

    let mut ordered_groups: Vec<Vec<WebhookEventRow>> = groups.into_values().collect();
    for group in &mut ordered_groups {
        group.sort_by(|a, b| causal_key(a).cmp(&causal_key(b)));
    }
    ordered_groups.sort_by(|a, b| {
        let a_first = a.first().map(causal_key);
        let b_first = b.first().map(causal_key);
        a_first.cmp(&b_first)
    });

    ordered_groups.into_iter().flatten().collect()
}

fn group_key(event: &WebhookEventRow) -> String {
    if !event.invoice_ref.is_empty() {
        return format!("invoice:{}", event.invoice_ref);
    }
    if let Some(attempt_id) = event.attempt_id {
        return format!("attempt:{attempt_id}");
    }
    format!("event:{}", event.id)
}

fn causal_key(event: &WebhookEventRow) -> (Option<time::OffsetDateTime>, time::OffsetDateTime, Uuid) {
    (event.provider_modified_at, event.received_at, event.id)
}
