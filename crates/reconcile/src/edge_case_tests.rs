// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Reconciliation Engine
//!
//! Tests critical boundary conditions in:
//! - Apply decisions (REC-D01 to REC-D14)
//! - Ordering and convergence (REC-O01 to REC-O03)
//! - Payment-state transitions (REC-T01 to REC-T05)
//! - Stored-event drain ordering (REC-J01 to REC-J04)
//! - Configuration (REC-C01 to REC-C06)

use time::OffsetDateTime;

fn ts(unix: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(unix).unwrap()
}

mod decision_tests {
    use super::ts;
    use crate::apply::{decide, AttemptFacts, Decision, EventFacts, OrderFacts};
    use crate::orders::{AttemptStatus, PaymentStatus, Provider};
    use crate::payload::InvoiceStatus;

    fn event(status: InvoiceStatus, amount: Option<i64>, modified: Option<i64>) -> EventFacts {
        EventFacts {
            status,
            amount,
            currency: Some(980),
            modified_at: modified.map(ts),
        }
    }

    fn attempt(expected: i64, seen: Option<i64>) -> AttemptFacts {
        AttemptFacts {
            expected_amount: expected,
            provider_modified_at: seen.map(ts),
        }
    }

    fn order(payment_status: PaymentStatus) -> OrderFacts {
        OrderFacts {
            provider: Provider::Mono,
            currency: "UAH".to_string(),
            payment_status,
        }
    }

    // =========================================================================
    // REC-D01: Success with matching amount on a pending order - mark paid
    // =========================================================================
    #[test]
    fn happy_path_success_marks_paid() {
        let decision = decide(
            &event(InvoiceStatus::Success, Some(1000), Some(10)),
            &attempt(1000, None),
            &order(PaymentStatus::Pending),
        );
        assert_eq!(decision, Decision::MarkPaid);
    }

    // =========================================================================
    // REC-D02: Amount off by one minor unit - mismatch, never paid
    // =========================================================================
    #[test]
    fn amount_off_by_one_is_mismatch() {
        let decision = decide(
            &event(InvoiceStatus::Success, Some(1001), Some(10)),
            &attempt(1000, None),
            &order(PaymentStatus::Pending),
        );
        assert_eq!(decision, Decision::AmountMismatch);
    }

    // =========================================================================
    // REC-D03: Mismatched amount never yields MarkPaid for any status
    // =========================================================================
    #[test]
    fn mismatch_never_pays_regardless_of_status() {
        let statuses = [
            InvoiceStatus::Created,
            InvoiceStatus::Processing,
            InvoiceStatus::Hold,
            InvoiceStatus::Success,
            InvoiceStatus::Failure,
            InvoiceStatus::Expired,
            InvoiceStatus::Reversed,
            InvoiceStatus::Unknown,
        ];
        for status in statuses {
            let decision = decide(
                &event(status, Some(999), Some(10)),
                &attempt(1000, None),
                &order(PaymentStatus::Pending),
            );
            assert_ne!(
                decision,
                Decision::MarkPaid,
                "{status:?} with wrong amount must not pay"
            );
        }
    }

    // =========================================================================
    // REC-D04: Order currency is not the provider's settlement currency
    // =========================================================================
    #[test]
    fn foreign_order_currency_is_mismatch() {
        let mut foreign = order(PaymentStatus::Pending);
        foreign.currency = "EUR".to_string();
        let decision = decide(
            &event(InvoiceStatus::Success, Some(1000), Some(10)),
            &attempt(1000, None),
            &foreign,
        );
        assert_eq!(decision, Decision::AmountMismatch);
    }

    // =========================================================================
    // REC-D05: Payload currency disagrees with the provider's numeric code
    // =========================================================================
    #[test]
    fn foreign_payload_currency_is_mismatch() {
        let mut facts = event(InvoiceStatus::Success, Some(1000), Some(10));
        facts.currency = Some(840);
        let decision = decide(&facts, &attempt(1000, None), &order(PaymentStatus::Pending));
        assert_eq!(decision, Decision::AmountMismatch);
    }

    // =========================================================================
    // REC-D06: Success without any amount cannot be validated
    // =========================================================================
    #[test]
    fn success_without_amount_is_mismatch() {
        let decision = decide(
            &event(InvoiceStatus::Success, None, Some(10)),
            &attempt(1000, None),
            &order(PaymentStatus::Pending),
        );
        assert_eq!(decision, Decision::AmountMismatch);
    }

    // =========================================================================
    // REC-D07: Paid is terminal against every incoming status
    // =========================================================================
    #[test]
    fn paid_order_is_sticky() {
        let statuses = [
            InvoiceStatus::Created,
            InvoiceStatus::Processing,
            InvoiceStatus::Hold,
            InvoiceStatus::Success,
            InvoiceStatus::Failure,
            InvoiceStatus::Expired,
            InvoiceStatus::Reversed,
            InvoiceStatus::Unknown,
        ];
        for status in statuses {
            let decision = decide(
                &event(status, Some(1000), Some(50)),
                &attempt(1000, Some(10)),
                &order(PaymentStatus::Paid),
            );
            assert_eq!(
                decision,
                Decision::AlreadyPaid,
                "{status:?} must not move a paid order"
            );
        }
    }

    // =========================================================================
    // REC-D08: Needs-review orders are human-gated, even for a correct
    // success arriving after an earlier mismatch parked the order
    // =========================================================================
    #[test]
    fn needs_review_gates_later_valid_success() {
        let decision = decide(
            &event(InvoiceStatus::Success, Some(1000), Some(50)),
            &attempt(1000, Some(10)),
            &order(PaymentStatus::NeedsReview),
        );
        assert_eq!(decision, Decision::HumanGated);
    }

    // =========================================================================
    // REC-D09: Success for a failed order is a resurrection, not a payment
    // =========================================================================
    #[test]
    fn late_success_on_failed_order_goes_to_review() {
        let decision = decide(
            &event(InvoiceStatus::Success, Some(1000), Some(50)),
            &attempt(1000, Some(10)),
            &order(PaymentStatus::Failed),
        );
        assert_eq!(decision, Decision::Resurrection);

        let decision = decide(
            &event(InvoiceStatus::Success, Some(1000), Some(50)),
            &attempt(1000, Some(10)),
            &order(PaymentStatus::Refunded),
        );
        assert_eq!(decision, Decision::Resurrection);
    }

    // =========================================================================
    // REC-D10: Repeating a terminal signal on a finalized order is a noop
    // =========================================================================
    #[test]
    fn repeated_failure_on_failed_order_is_noop() {
        let decision = decide(
            &event(InvoiceStatus::Failure, Some(1000), Some(50)),
            &attempt(1000, Some(10)),
            &order(PaymentStatus::Failed),
        );
        assert_eq!(decision, Decision::AlreadyFinalized);
    }

    // =========================================================================
    // REC-D11: In-flight statuses leave the order alone
    // =========================================================================
    #[test]
    fn in_flight_statuses_are_noops() {
        for status in [
            InvoiceStatus::Created,
            InvoiceStatus::Processing,
            InvoiceStatus::Hold,
        ] {
            let decision = decide(
                &event(status, Some(1000), Some(10)),
                &attempt(1000, None),
                &order(PaymentStatus::RequiresPayment),
            );
            assert_eq!(decision, Decision::InFlight);
        }
    }

    // =========================================================================
    // REC-D12: Failure and expiry finalize as failed; reversal as refunded
    // =========================================================================
    #[test]
    fn failure_expiry_and_reversal_finalize() {
        for status in [InvoiceStatus::Failure, InvoiceStatus::Expired] {
            let decision = decide(
                &event(status, Some(1000), Some(10)),
                &attempt(1000, None),
                &order(PaymentStatus::RequiresPayment),
            );
            assert_eq!(
                decision,
                Decision::Finalize {
                    order_to: PaymentStatus::Failed,
                    attempt_to: AttemptStatus::Failed,
                }
            );
        }

        let decision = decide(
            &event(InvoiceStatus::Reversed, Some(1000), Some(10)),
            &attempt(1000, None),
            &order(PaymentStatus::RequiresPayment),
        );
        assert_eq!(
            decision,
            Decision::Finalize {
                order_to: PaymentStatus::Refunded,
                attempt_to: AttemptStatus::Canceled,
            }
        );
    }

    // =========================================================================
    // REC-D13: Unrecognized status surfaces as an issue, never silently
    // =========================================================================
    #[test]
    fn unknown_status_is_flagged() {
        let decision = decide(
            &event(InvoiceStatus::Unknown, Some(1000), Some(10)),
            &attempt(1000, None),
            &order(PaymentStatus::Pending),
        );
        assert_eq!(decision, Decision::UnknownStatus);
    }

    // =========================================================================
    // REC-D14: Failure events with the right amount still respect ordering
    // =========================================================================
    #[test]
    fn stale_failure_does_not_overwrite() {
        let decision = decide(
            &event(InvoiceStatus::Failure, Some(1000), Some(5)),
            &attempt(1000, Some(10)),
            &order(PaymentStatus::RequiresPayment),
        );
        assert_eq!(decision, Decision::Stale);
    }
}

mod ordering_tests {
    use super::ts;
    use crate::apply::{decide, AttemptFacts, Decision, EventFacts, OrderFacts};
    use crate::orders::{PaymentStatus, Provider};
    use crate::payload::InvoiceStatus;

    fn success(amount: i64, modified: Option<i64>) -> EventFacts {
        EventFacts {
            status: InvoiceStatus::Success,
            amount: Some(amount),
            currency: Some(980),
            modified_at: modified.map(ts),
        }
    }

    fn order(payment_status: PaymentStatus) -> OrderFacts {
        OrderFacts {
            provider: Provider::Mono,
            currency: "UAH".to_string(),
            payment_status,
        }
    }

    // =========================================================================
    // REC-O01: Event not newer than the recorded provider clock is stale
    // =========================================================================
    #[test]
    fn equal_or_older_timestamp_is_stale() {
        let attempt = AttemptFacts {
            expected_amount: 1000,
            provider_modified_at: Some(ts(10)),
        };
        assert_eq!(
            decide(&success(1000, Some(5)), &attempt, &order(PaymentStatus::Pending)),
            Decision::Stale
        );
        assert_eq!(
            decide(&success(1000, Some(10)), &attempt, &order(PaymentStatus::Pending)),
            Decision::Stale
        );
        assert_eq!(
            decide(&success(1000, Some(11)), &attempt, &order(PaymentStatus::Pending)),
            Decision::MarkPaid
        );
    }

    // =========================================================================
    // REC-O02: An event without a timestamp cannot beat a recorded one
    // =========================================================================
    #[test]
    fn timestampless_event_is_stale_once_clock_recorded() {
        let attempt = AttemptFacts {
            expected_amount: 1000,
            provider_modified_at: Some(ts(10)),
        };
        assert_eq!(
            decide(&success(1000, None), &attempt, &order(PaymentStatus::Pending)),
            Decision::Stale
        );

        let fresh = AttemptFacts {
            expected_amount: 1000,
            provider_modified_at: None,
        };
        assert_eq!(
            decide(&success(1000, None), &fresh, &order(PaymentStatus::Pending)),
            Decision::MarkPaid
        );
    }

    // =========================================================================
    // REC-O03: Both delivery orders converge on the t=10 outcome
    // =========================================================================
    #[test]
    fn redelivery_order_converges() {
        // In-order: E1 (t=10) applies, E2 (t=5) is stale.
        let mut attempt = AttemptFacts {
            expected_amount: 1000,
            provider_modified_at: None,
        };
        let mut state = PaymentStatus::Pending;

        assert_eq!(
            decide(&success(1000, Some(10)), &attempt, &order(state)),
            Decision::MarkPaid
        );
        state = PaymentStatus::Paid;
        attempt.provider_modified_at = Some(ts(10));
        assert_eq!(
            decide(&success(1000, Some(5)), &attempt, &order(state)),
            Decision::Stale
        );
        let in_order_final = state;

        // Redelivered: E2 (t=5) lands first and applies, E1 (t=10) then
        // finds the order already settled the way t=10 dictates.
        let mut attempt = AttemptFacts {
            expected_amount: 1000,
            provider_modified_at: None,
        };
        let mut state = PaymentStatus::Pending;

        assert_eq!(
            decide(&success(1000, Some(5)), &attempt, &order(state)),
            Decision::MarkPaid
        );
        state = PaymentStatus::Paid;
        attempt.provider_modified_at = Some(ts(5));
        assert_eq!(
            decide(&success(1000, Some(10)), &attempt, &order(state)),
            Decision::AlreadyPaid
        );

        assert_eq!(state, in_order_final);
    }
}

mod transition_tests {
    use crate::orders::{payment_transition_allowed, PaymentStatus, Provider};

    // =========================================================================
    // REC-T01: The engine can settle a pending order either way
    // =========================================================================
    #[test]
    fn pending_order_can_settle() {
        for to in [
            PaymentStatus::Paid,
            PaymentStatus::Failed,
            PaymentStatus::Refunded,
            PaymentStatus::NeedsReview,
        ] {
            assert!(payment_transition_allowed(
                Provider::Mono,
                PaymentStatus::Pending,
                to
            ));
            assert!(payment_transition_allowed(
                Provider::Mono,
                PaymentStatus::RequiresPayment,
                to
            ));
        }
    }

    // =========================================================================
    // REC-T02: Paid is a dead end for automation
    // =========================================================================
    #[test]
    fn paid_is_terminal() {
        for to in [
            PaymentStatus::Pending,
            PaymentStatus::RequiresPayment,
            PaymentStatus::Failed,
            PaymentStatus::Refunded,
            PaymentStatus::NeedsReview,
            PaymentStatus::Paid,
        ] {
            assert!(!payment_transition_allowed(
                Provider::Mono,
                PaymentStatus::Paid,
                to
            ));
        }
    }

    // =========================================================================
    // REC-T03: Needs-review only moves by operator hand
    // =========================================================================
    #[test]
    fn needs_review_is_not_automatable() {
        for to in [
            PaymentStatus::Paid,
            PaymentStatus::Failed,
            PaymentStatus::Refunded,
            PaymentStatus::Pending,
        ] {
            assert!(!payment_transition_allowed(
                Provider::Mono,
                PaymentStatus::NeedsReview,
                to
            ));
        }
    }

    // =========================================================================
    // REC-T04: Finalized orders can still be escalated to review
    // =========================================================================
    #[test]
    fn finalized_orders_can_escalate_to_review() {
        assert!(payment_transition_allowed(
            Provider::Mono,
            PaymentStatus::Failed,
            PaymentStatus::NeedsReview
        ));
        assert!(payment_transition_allowed(
            Provider::Mono,
            PaymentStatus::Refunded,
            PaymentStatus::NeedsReview
        ));
        assert!(!payment_transition_allowed(
            Provider::Mono,
            PaymentStatus::Failed,
            PaymentStatus::Paid
        ));
    }

    // =========================================================================
    // REC-T05: Stripe orders are untouchable from this engine
    // =========================================================================
    #[test]
    fn stripe_orders_never_transition_here() {
        assert!(!payment_transition_allowed(
            Provider::Stripe,
            PaymentStatus::Pending,
            PaymentStatus::Paid
        ));
        assert!(!payment_transition_allowed(
            Provider::Stripe,
            PaymentStatus::Pending,
            PaymentStatus::Failed
        ));
    }
}

mod drain_ordering_tests {
    use super::ts;
    use crate::event_drainer::order_canonically;
    use crate::events::WebhookEventRow;
    use uuid::Uuid;

    fn row(
        n: u128,
        invoice_ref: &str,
        provider_modified: Option<i64>,
        received: i64,
    ) -> WebhookEventRow {
        WebhookEventRow {
            id: Uuid::from_u128(n),
            event_key: format!("mono:evt_{n}"),
            invoice_ref: invoice_ref.to_string(),
            status: "processing".to_string(),
            amount: Some(1000),
            currency: Some(980),
            reference: None,
            payload: serde_json::json!({}),
            payload_hash: format!("hash_{n}"),
            provider_modified_at: provider_modified.map(ts),
            received_at: ts(received),
            applied_at: None,
            applied_result: Some("stored".to_string()),
            applied_error_code: None,
            applied_error_message: None,
            attempt_id: None,
            order_id: None,
            claimed_at: None,
            claim_expires_at: None,
            claimed_by: None,
        }
    }

    fn ids(rows: &[WebhookEventRow]) -> Vec<u128> {
        rows.iter().map(|r| r.id.as_u128()).collect()
    }

    // =========================================================================
    // REC-J01: One invoice, receipt order scrambled, provider clock wins
    // =========================================================================
    #[test]
    fn provider_clock_beats_receipt_order() {
        let batch = vec![
            row(1, "inv_a", Some(30), 100),
            row(2, "inv_a", Some(10), 300),
            row(3, "inv_a", Some(20), 200),
        ];
        assert_eq!(ids(&order_canonically(batch)), vec![2, 3, 1]);
    }

    // =========================================================================
    // REC-J02: Ties on the provider clock fall back to receipt time then id
    // =========================================================================
    #[test]
    fn ties_fall_back_to_receipt_then_id() {
        let batch = vec![
            row(2, "inv_a", Some(10), 200),
            row(1, "inv_a", Some(10), 100),
            row(4, "inv_a", Some(10), 300),
            row(3, "inv_a", Some(10), 300),
        ];
        assert_eq!(ids(&order_canonically(batch)), vec![1, 2, 3, 4]);
    }

    // =========================================================================
    // REC-J03: Groups stay contiguous and sort by their first member
    // =========================================================================
    #[test]
    fn groups_are_contiguous_and_ordered() {
        let batch = vec![
            row(1, "inv_b", Some(40), 100),
            row(2, "inv_a", Some(10), 200),
            row(3, "inv_b", Some(50), 300),
            row(4, "inv_a", Some(20), 400),
        ];
        // inv_a's earliest event (t=10) precedes inv_b's earliest (t=40).
        assert_eq!(ids(&order_canonically(batch)), vec![2, 4, 1, 3]);
    }

    // =========================================================================
    // REC-J04: No invoice ref falls back to attempt id, then to the event
    // =========================================================================
    #[test]
    fn fallback_grouping_for_refless_events() {
        let attempt = Uuid::from_u128(99);
        let mut a = row(1, "", Some(10), 100);
        a.attempt_id = Some(attempt);
        let mut b = row(2, "", Some(20), 200);
        b.attempt_id = Some(attempt);
        let c = row(3, "", Some(5), 300);

        let ordered = order_canonically(vec![b, c, a]);
        let ordered_ids = ids(&ordered);
        // The singleton (t=5) leads; the attempt group follows in clock order.
        assert_eq!(ordered_ids, vec![3, 1, 2]);
    }

    // =========================================================================
    // Events missing a provider clock sort before timestamped ones, so a
    // status-only legacy event cannot jump ahead of fresher data
    // =========================================================================
    #[test]
    fn clockless_events_sort_first_within_group() {
        let batch = vec![
            row(1, "inv_a", Some(10), 100),
            row(2, "inv_a", None, 50),
        ];
        assert_eq!(ids(&order_canonically(batch)), vec![2, 1]);
    }
}

mod mode_gate_tests {
    use std::sync::Arc;

    use crate::config::{ReconcileConfig, WebhookMode};
    use crate::error::ReconcileError;
    use crate::event_drainer::StoredEventDrainer;
    use crate::inventory::{InventoryLedger, RestockReason};
    use crate::ReconcileResult;
    use async_trait::async_trait;
    use uuid::Uuid;

    struct NullLedger;

    #[async_trait]
    impl InventoryLedger for NullLedger {
        async fn restock_order(
            &self,
            _order_id: Uuid,
            _reason: RestockReason,
            _worker_id: &str,
        ) -> ReconcileResult<()> {
            Ok(())
        }
    }

    fn lazy_pool() -> sqlx::PgPool {
        sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/kram_test")
            .unwrap()
    }

    // =========================================================================
    // The drainer refuses to exist outside store mode
    // =========================================================================
    #[tokio::test]
    async fn drainer_refuses_live_apply_deployments() {
        for mode in [WebhookMode::Apply, WebhookMode::Drop] {
            let config = ReconcileConfig {
                mode,
                ..ReconcileConfig::default()
            };
            let result = StoredEventDrainer::new(lazy_pool(), config, Arc::new(NullLedger));
            assert!(matches!(result, Err(ReconcileError::ModeMismatch(_))));
        }
    }

    #[tokio::test]
    async fn drainer_accepts_store_mode() {
        let config = ReconcileConfig {
            mode: WebhookMode::Store,
            ..ReconcileConfig::default()
        };
        assert!(StoredEventDrainer::new(lazy_pool(), config, Arc::new(NullLedger)).is_ok());
    }
}

mod config_tests {
    use crate::config::{ReconcileConfig, WebhookMode};
    use serial_test::serial;

    const VARS: &[&str] = &[
        "RECONCILE_WEBHOOK_MODE",
        "RECONCILE_STALE_GRACE_SECS",
        "RECONCILE_ORPHAN_TTL_SECS",
        "RECONCILE_LEASE_SECS",
        "RECONCILE_REVIEW_AGE_HOURS",
        "RECONCILE_SWEEP_BATCH",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    // =========================================================================
    // REC-C01: Bare environment yields the documented defaults
    // =========================================================================
    #[test]
    #[serial]
    fn defaults_without_env() {
        clear_env();
        let config = ReconcileConfig::from_env().unwrap();
        assert_eq!(config.mode, WebhookMode::Apply);
        assert_eq!(config.stale_grace_secs, 900);
        assert_eq!(config.orphan_ttl_secs, 120);
        assert_eq!(config.lease_secs, 120);
        assert_eq!(config.review_age_hours, 24);
        assert_eq!(config.sweep_batch, 50);
    }

    // =========================================================================
    // REC-C02: Values outside sane bounds are clamped, not honored
    // =========================================================================
    #[test]
    #[serial]
    fn out_of_bounds_values_clamp() {
        clear_env();
        std::env::set_var("RECONCILE_LEASE_SECS", "5");
        std::env::set_var("RECONCILE_ORPHAN_TTL_SECS", "999999");
        let config = ReconcileConfig::from_env().unwrap();
        assert_eq!(config.lease_secs, 10);
        assert_eq!(config.orphan_ttl_secs, 3600);
        clear_env();
    }

    // =========================================================================
    // REC-C03: Garbage numeric values fall back to the default
    // =========================================================================
    #[test]
    #[serial]
    fn garbage_values_fall_back() {
        clear_env();
        std::env::set_var("RECONCILE_STALE_GRACE_SECS", "fifteen minutes");
        let config = ReconcileConfig::from_env().unwrap();
        assert_eq!(config.stale_grace_secs, 900);
        clear_env();
    }

    // =========================================================================
    // REC-C04: A typo'd webhook mode is a hard startup error
    // =========================================================================
    #[test]
    #[serial]
    fn unknown_mode_is_an_error() {
        clear_env();
        std::env::set_var("RECONCILE_WEBHOOK_MODE", "buffer");
        assert!(ReconcileConfig::from_env().is_err());
        clear_env();
    }

    // =========================================================================
    // REC-C05: Mode parsing is case-insensitive
    // =========================================================================
    #[test]
    #[serial]
    fn mode_parsing_tolerates_case() {
        clear_env();
        std::env::set_var("RECONCILE_WEBHOOK_MODE", "Store");
        let config = ReconcileConfig::from_env().unwrap();
        assert_eq!(config.mode, WebhookMode::Store);
        clear_env();
    }

    // =========================================================================
    // REC-C06: In-bounds values pass through untouched
    // =========================================================================
    #[test]
    #[serial]
    fn in_bounds_values_pass_through() {
        clear_env();
        std::env::set_var("RECONCILE_SWEEP_BATCH", "200");
        let config = ReconcileConfig::from_env().unwrap();
        assert_eq!(config.sweep_batch, 200);
        clear_env();
    }
}

mod issue_code_tests {
    use crate::error::IssueCode;

    // Dashboards group on these strings; they are load-bearing.
    #[test]
    fn audit_codes_are_stable() {
        assert_eq!(IssueCode::AmountMismatch.as_str(), "AMOUNT_MISMATCH");
        assert_eq!(IssueCode::OutOfOrder.as_str(), "OUT_OF_ORDER");
        assert_eq!(IssueCode::PaymentStateBlocked.as_str(), "PAYMENT_STATE_BLOCKED");
        assert_eq!(IssueCode::DrainApplyFailed.as_str(), "JANITOR_JOB3_APPLY_FAILED");
        assert_eq!(IssueCode::InvoiceMissing.as_str(), "invoice_missing");
    }
}
