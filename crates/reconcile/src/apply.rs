//! The webhook apply state machine.
//!
//! Split in two layers. `decide` is a pure function over in-memory
//! snapshots — ordering guard, money guard, terminal stickiness,
//! resurrection guard, status classification — so every branch can be
//! exercised without a database. `WebhookApplier` wraps it with the claim,
//! attempt/order resolution, the conditional updates, and the audit stamp.
//!
//! Whatever happens, the event row ends up recording the outcome; the row,
//! not the HTTP response, is the source of truth for "what happened to
//! this event".

use std::sync::Arc;

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::claims::ClaimCoordinator;
use crate::config::{ReconcileConfig, WebhookMode};
use crate::error::{IssueCode, ReconcileResult};
use crate::events::{AppliedResult, EventStore, WebhookEventRow};
use crate::inventory::{InventoryLedger, RestockReason};
use crate::orders::{AttemptStatus, OrderStore, PaymentStatus, Provider};
use crate::payload::{InvoiceStatus, NormalizedEvent};

/// Event fields the decision depends on.
#[derive(Debug, Clone)]
pub struct EventFacts {
    pub status: InvoiceStatus,
    pub amount: Option<i64>,
    pub currency: Option<i32>,
    pub modified_at: Option<OffsetDateTime>,
}

impl EventFacts {
    pub fn of(event: &NormalizedEvent) -> Self {
        Self {
            status: event.status,
            amount: event.amount,
            currency: event.currency,
            modified_at: event.modified_at,
        }
    }
}

/// Attempt fields the decision depends on.
#[derive(Debug, Clone)]
pub struct AttemptFacts {
    pub expected_amount: i64,
    pub provider_modified_at: Option<OffsetDateTime>,
}

/// Order fields the decision depends on.
#[derive(Debug, Clone)]
pub struct OrderFacts {
    pub provider: Provider,
    pub currency: String,
    pub payment_status: PaymentStatus,
}

/// What the state machine decided to do with one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Event is not newer than the attempt's recorded provider state.
    Stale,
    /// Amount or currency disagrees with what the attempt expects.
    AmountMismatch,
    /// Order already paid; nothing may change it.
    AlreadyPaid,
    /// Order parked for operator review; automation stops here.
    HumanGated,
    /// A success signal arrived for an order already failed or refunded.
    Resurrection,
    /// Order already sits in the terminal state this event describes.
    AlreadyFinalized,
    MarkPaid,
    InFlight,
    Finalize {
        order_to: PaymentStatus,
        attempt_to: AttemptStatus,
    },
    UnknownStatus,
}

/// Pure decision core. Guards are evaluated in strict order; the first
/// match wins.
pub fn decide(event: &EventFacts, attempt: &AttemptFacts, order: &OrderFacts) -> Decision {
    // Ordering guard: a stale notification never overwrites fresher state.
    // An event with no timestamp cannot prove it is newer once a timestamp
    // has been recorded.
    if let Some(seen) = attempt.provider_modified_at {
        match event.modified_at {
            Some(at) if at > seen => {}
            _ => return Decision::Stale,
        }
    }

    // Money guard, before any status is honored. A success event that
    // carries no amount cannot be validated and is treated as a mismatch.
    if order.currency != order.provider.native_currency_alpha() {
        return Decision::AmountMismatch;
    }
    if let Some(ccy) = event.currency {
        if ccy != order.provider.native_currency_numeric() {
            return Decision::AmountMismatch;
        }
    }
    match event.amount {
        Some(amount) if amount != attempt.expected_amount => return Decision::AmountMismatch,
        None if event.status.is_success() => return Decision::AmountMismatch,
        _ => {}
    }

    if order.payment_status == PaymentStatus::Paid {
        return Decision::AlreadyPaid;
    }
    if order.payment_status == PaymentStatus::NeedsReview {
        return Decision::HumanGated;
    }

    if matches!(
        order.payment_status,
        PaymentStatus::Failed | PaymentStatus::Refunded
    ) {
        if event.status.is_success() {
            return Decision::Resurrection;
        }
        return Decision::AlreadyFinalized;
    }

    match event.status {
        InvoiceStatus::Success => Decision::MarkPaid,
        InvoiceStatus::Created | InvoiceStatus::Processing | InvoiceStatus::Hold => {
            Decision::InFlight
        }
        InvoiceStatus::Failure | InvoiceStatus::Expired => Decision::Finalize {
            order_to: PaymentStatus::Failed,
            attempt_to: AttemptStatus::Failed,
        },
        InvoiceStatus::Reversed => Decision::Finalize {
            order_to: PaymentStatus::Refunded,
            attempt_to: AttemptStatus::Canceled,
        },
        InvoiceStatus::Unknown => Decision::UnknownStatus,
    }
}

/// Result of driving one event through the machine.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub result: AppliedResult,
    pub issue: Option<IssueCode>,
    pub order_id: Option<Uuid>,
    pub attempt_id: Option<Uuid>,
    /// Inventory release the *caller* performs, so the state transition and
    /// the stock side effect stay separately retryable.
    pub restock: Option<RestockReason>,
}

impl ApplyOutcome {
    fn bare(result: AppliedResult) -> Self {
        Self {
            result,
            issue: None,
            order_id: None,
            attempt_id: None,
            restock: None,
        }
    }
}

pub struct WebhookApplier {
    events: EventStore,
    orders: OrderStore,
    claims: ClaimCoordinator,
    lease_secs: i64,
}

impl WebhookApplier {
    pub fn new(pool: PgPool, lease_secs: i64) -> Self {
        Self {
            events: EventStore::new(pool.clone()),
            orders: OrderStore::new(pool.clone()),
            claims: ClaimCoordinator::new(pool),
            lease_secs,
        }
    }

    /// Apply one stored event. The caller has already passed the dedup and
    /// mode gates.
    pub async fn apply(
        &self,
        event: &WebhookEventRow,
        normalized: &NormalizedEvent,
        worker_id: &str,
    ) -> ReconcileResult<ApplyOutcome> {
        if !self
            .claims
            .claim_event(event.id, worker_id, self.lease_secs)
            .await?
        {
            // The claim holder stamps the row; the loser reports a noop
            // without touching it.
            tracing::debug!(event_id = %event.id, "Event claimed by another worker");
            return Ok(ApplyOutcome::bare(AppliedResult::AppliedNoop));
        }

        let verdict = self.apply_claimed(event, normalized).await;

        if let Err(e) = self.claims.release_event(event.id, worker_id).await {
            // Non-fatal: the lease expires on its own.
            tracing::warn!(event_id = %event.id, error = %e, "Failed to release event claim");
        }

        verdict
    }

    async fn apply_claimed(
        &self,
        event: &WebhookEventRow,
        normalized: &NormalizedEvent,
    ) -> ReconcileResult<ApplyOutcome> {
        let Some(attempt) = self
            .orders
            .resolve_attempt(normalized.reference.as_deref(), &normalized.invoice_ref)
            .await?
        else {
            tracing::warn!(
                event_id = %event.id,
                invoice_ref = %normalized.invoice_ref,
                "No payment attempt matches this notification"
            );
            return self
                .stamp(
                    event.id,
                    AppliedResult::Unmatched,
                    Some(IssueCode::AttemptNotFound),
                    Some("no payment attempt matches this notification"),
                    None,
                    None,
                    None,
                )
                .await;
        };

        let Some(order) = self.orders.load_order(attempt.order_id).await? else {
            tracing::warn!(
                event_id = %event.id,
                attempt_id = %attempt.id,
                order_id = %attempt.order_id,
                "Attempt references an order that does not exist"
            );
            return self
                .stamp(
                    event.id,
                    AppliedResult::Unmatched,
                    Some(IssueCode::OrderNotFound),
                    Some("attempt references a missing order"),
                    Some(attempt.id),
                    None,
                    None,
                )
                .await;
        };

        let (Some(provider), Some(payment_status)) = (order.provider_kind(), order.payment_state())
        else {
            tracing::error!(
                event_id = %event.id,
                order_id = %order.id,
                provider = %order.provider,
                payment_status = %order.payment_status,
                "Order carries an unrecognized provider or payment status"
            );
            return self
                .stamp(
                    event.id,
                    AppliedResult::AppliedWithIssue,
                    Some(IssueCode::UnknownStatus),
                    Some("order row carries unrecognized state"),
                    Some(attempt.id),
                    Some(order.id),
                    None,
                )
                .await;
        };

        let facts = EventFacts::of(normalized);
        let attempt_facts = AttemptFacts {
            expected_amount: attempt.expected_amount,
            provider_modified_at: attempt.provider_modified_at,
        };
        let order_facts = OrderFacts {
            provider,
            currency: order.currency.clone(),
            payment_status,
        };

        match decide(&facts, &attempt_facts, &order_facts) {
            Decision::Stale => {
                self.stamp(
                    event.id,
                    AppliedResult::AppliedNoop,
                    Some(IssueCode::OutOfOrder),
                    Some("event is older than the attempt's recorded provider state"),
                    Some(attempt.id),
                    Some(order.id),
                    None,
                )
                .await
            }

            Decision::AmountMismatch => {
                if !matches!(
                    payment_status,
                    PaymentStatus::Paid | PaymentStatus::NeedsReview
                ) {
                    let parked = self
                        .orders
                        .park_needs_review(order.id, provider, payment_status, "amount_mismatch")
                        .await?;
                    if !parked {
                        tracing::warn!(
                            order_id = %order.id,
                            "Lost the race parking a mismatched order; the winning writer owns it"
                        );
                    }
                }
                let message = format!(
                    "expected {} {}, payload carried {:?}/{:?}",
                    attempt.expected_amount,
                    order.currency,
                    normalized.amount,
                    normalized.currency,
                );
                self.orders
                    .finalize_attempt(
                        attempt.id,
                        AttemptStatus::Failed,
                        Some(IssueCode::AmountMismatch.as_str()),
                        Some(message.as_str()),
                        normalized.modified_at,
                    )
                    .await?;
                tracing::error!(
                    event_id = %event.id,
                    order_id = %order.id,
                    attempt_id = %attempt.id,
                    expected = attempt.expected_amount,
                    amount = ?normalized.amount,
                    currency = ?normalized.currency,
                    "Amount mismatch; order parked for review"
                );
                self.stamp(
                    event.id,
                    AppliedResult::AppliedWithIssue,
                    Some(IssueCode::AmountMismatch),
                    Some(message.as_str()),
                    Some(attempt.id),
                    Some(order.id),
                    None,
                )
                .await
            }

            Decision::AlreadyPaid => {
                self.stamp(
                    event.id,
                    AppliedResult::AppliedNoop,
                    None,
                    Some("order already paid"),
                    Some(attempt.id),
                    Some(order.id),
                    None,
                )
                .await
            }

            Decision::HumanGated => {
                self.stamp(
                    event.id,
                    AppliedResult::AppliedNoop,
                    None,
                    Some("order awaits operator review"),
                    Some(attempt.id),
                    Some(order.id),
                    None,
                )
                .await
            }

            Decision::Resurrection => {
                let parked = self
                    .orders
                    .park_needs_review(order.id, provider, payment_status, "late_success")
                    .await?;
                if !parked {
                    tracing::warn!(
                        order_id = %order.id,
                        "Lost the race parking a resurrected order"
                    );
                }
                tracing::error!(
                    event_id = %event.id,
                    order_id = %order.id,
                    from = %payment_status,
                    "Success event arrived for a finalized order; parked for review"
                );
                self.stamp(
                    event.id,
                    AppliedResult::AppliedWithIssue,
                    Some(IssueCode::OutOfOrder),
                    Some("success event for an already-finalized order"),
                    Some(attempt.id),
                    Some(order.id),
                    None,
                )
                .await
            }

            Decision::AlreadyFinalized => {
                self.stamp(
                    event.id,
                    AppliedResult::AppliedNoop,
                    None,
                    Some("order already finalized with this outcome"),
                    Some(attempt.id),
                    Some(order.id),
                    None,
                )
                .await
            }

            Decision::MarkPaid => {
                let won = self
                    .orders
                    .mark_paid(
                        order.id,
                        provider,
                        payment_status,
                        Some(normalized.invoice_ref.as_str()),
                    )
                    .await?;
                if !won {
                    return self
                        .stamp(
                            event.id,
                            AppliedResult::AppliedWithIssue,
                            Some(IssueCode::PaymentStateBlocked),
                            Some("payment-state transition lost to a concurrent writer"),
                            Some(attempt.id),
                            Some(order.id),
                            None,
                        )
                        .await;
                }
                self.orders
                    .finalize_attempt(
                        attempt.id,
                        AttemptStatus::Succeeded,
                        None,
                        None,
                        normalized.modified_at,
                    )
                    .await?;
                tracing::info!(
                    event_id = %event.id,
                    order_id = %order.id,
                    attempt_id = %attempt.id,
                    amount = ?normalized.amount,
                    "Order paid"
                );
                self.stamp(
                    event.id,
                    AppliedResult::Applied,
                    None,
                    None,
                    Some(attempt.id),
                    Some(order.id),
                    None,
                )
                .await
            }

            Decision::InFlight => {
                if let Some(at) = normalized.modified_at {
                    self.orders.advance_attempt_clock(attempt.id, at).await?;
                }
                self.stamp(
                    event.id,
                    AppliedResult::AppliedNoop,
                    None,
                    Some("invoice still in flight at the provider"),
                    Some(attempt.id),
                    Some(order.id),
                    None,
                )
                .await
            }

            Decision::Finalize {
                order_to,
                attempt_to,
            } => {
                let reason = normalized
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| normalized.status_raw.clone());
                let won = self
                    .orders
                    .mark_payment_failed(
                        order.id,
                        provider,
                        payment_status,
                        order_to,
                        Some(reason.as_str()),
                    )
                    .await?;
                if !won {
                    return self
                        .stamp(
                            event.id,
                            AppliedResult::AppliedWithIssue,
                            Some(IssueCode::PaymentStateBlocked),
                            Some("payment-state transition lost to a concurrent writer"),
                            Some(attempt.id),
                            Some(order.id),
                            None,
                        )
                        .await;
                }
                self.orders
                    .finalize_attempt(
                        attempt.id,
                        attempt_to,
                        Some(
                            normalized
                                .err_code
                                .as_deref()
                                .unwrap_or(&normalized.status_raw),
                        ),
                        normalized.failure_reason.as_deref(),
                        normalized.modified_at,
                    )
                    .await?;
                let restock = match order_to {
                    PaymentStatus::Refunded => RestockReason::Refunded,
                    _ => RestockReason::Failed,
                };
                tracing::info!(
                    event_id = %event.id,
                    order_id = %order.id,
                    attempt_id = %attempt.id,
                    outcome = %order_to,
                    reason = %reason,
                    "Order payment finalized without success"
                );
                self.stamp(
                    event.id,
                    AppliedResult::Applied,
                    None,
                    Some(reason.as_str()),
                    Some(attempt.id),
                    Some(order.id),
                    Some(restock),
                )
                .await
            }

            Decision::UnknownStatus => {
                // Operational alert: a status we do not understand must
                // never disappear silently.
                tracing::error!(
                    event_id = %event.id,
                    order_id = %order.id,
                    status = %normalized.status_raw,
                    "Provider sent an unrecognized invoice status"
                );
                let message = format!("unrecognized status '{}'", normalized.status_raw);
                self.stamp(
                    event.id,
                    AppliedResult::AppliedWithIssue,
                    Some(IssueCode::UnknownStatus),
                    Some(message.as_str()),
                    Some(attempt.id),
                    Some(order.id),
                    None,
                )
                .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn stamp(
        &self,
        event_id: Uuid,
        result: AppliedResult,
        issue: Option<IssueCode>,
        message: Option<&str>,
        attempt_id: Option<Uuid>,
        order_id: Option<Uuid>,
        restock: Option<RestockReason>,
    ) -> ReconcileResult<ApplyOutcome> {
        self.events
            .mark_outcome(event_id, result, issue, message, attempt_id, order_id)
            .await?;
        Ok(ApplyOutcome {
            result,
            issue,
            order_id,
            attempt_id,
            restock,
        })
    }
}

/// Entry point for live webhook deliveries.
pub struct WebhookPipeline {
    mode: WebhookMode,
    events: EventStore,
    applier: WebhookApplier,
    ledger: Arc<dyn InventoryLedger>,
}

impl WebhookPipeline {
    pub fn new(pool: PgPool, config: &ReconcileConfig, ledger: Arc<dyn InventoryLedger>) -> Self {
        Self {
            mode: config.mode,
            events: EventStore::new(pool.clone()),
            applier: WebhookApplier::new(pool, config.lease_secs),
            ledger,
        }
    }

    /// Ingest and (mode permitting) apply one delivery.
    pub async fn handle_delivery(
        &self,
        payload: serde_json::Value,
        worker_id: &str,
    ) -> ReconcileResult<ApplyOutcome> {
        let ingest = self.events.ingest(&payload).await?;

        if ingest.deduped {
            // The first delivery's outcome stands; nothing is re-applied.
            return Ok(ApplyOutcome {
                result: AppliedResult::Deduped,
                issue: None,
                order_id: ingest.event.order_id,
                attempt_id: ingest.event.attempt_id,
                restock: None,
            });
        }

        match self.mode {
            WebhookMode::Store => {
                self.events
                    .mark_outcome(ingest.event.id, AppliedResult::Stored, None, None, None, None)
                    .await?;
                return Ok(ApplyOutcome::bare(AppliedResult::Stored));
            }
            WebhookMode::Drop => {
                self.events
                    .mark_outcome(ingest.event.id, AppliedResult::Dropped, None, None, None, None)
                    .await?;
                return Ok(ApplyOutcome::bare(AppliedResult::Dropped));
            }
            WebhookMode::Apply => {}
        }

        let outcome = self
            .applier
            .apply(&ingest.event, &ingest.normalized, worker_id)
            .await?;
        self.run_restock(&outcome, worker_id).await;
        Ok(outcome)
    }

    /// Perform the inventory release an apply outcome asked for. The
    /// ledger is idempotent, so a failure here can be re-driven later
    /// without double-restocking.
    pub async fn run_restock(&self, outcome: &ApplyOutcome, worker_id: &str) {
        if let (Some(reason), Some(order_id)) = (outcome.restock, outcome.order_id) {
            if let Err(e) = self.ledger.restock_order(order_id, reason, worker_id).await {
                tracing::error!(
                    order_id = %order_id,
                    reason = %reason,
                    error = %e,
                    "Inventory release failed after payment finalization"
                );
            }
        }
    }
}
