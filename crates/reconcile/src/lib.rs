// Reconcile crate clippy configuration
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Kram Payment Reconciliation Engine
//!
//! Drives orders to a consistent terminal payment outcome from
//! asynchronous, possibly-duplicated, possibly-out-of-order acquirer
//! notifications and periodic repair sweeps.
//!
//! ## Guarantees
//!
//! - **At-most-once application**: every notification becomes exactly one
//!   audit row, keyed by a derived idempotency key; the insert is the
//!   dedup gate.
//! - **Exclusive processing without locks**: TTL leases taken via
//!   conditional UPDATEs; a crashed worker's claim self-expires.
//! - **Strict ordering and terminality**: a stale event never overwrites
//!   fresher state, `paid` is terminal, `needs_review` is human-gated.
//! - **Money safety**: amounts are validated before anything is marked
//!   paid; a mismatch can only ever park the order for review.
//! - **Exactly-once restock**: inventory release goes through an
//!   idempotent ledger keyed per order.
//!
//! All mutual exclusion is optimistic: conditional single-statement
//! updates whose `rows_affected` count is the race verdict. Every path is
//! re-driveable after a crash mid-sequence because each step re-validates
//! its own precondition.

pub mod apply;
pub mod claims;
pub mod config;
pub mod error;
pub mod event_drainer;
pub mod events;
pub mod inventory;
pub mod orders;
pub mod orphan_expirer;
pub mod payload;
pub mod provider;
pub mod review_reporter;
pub mod stale_reconciler;

#[cfg(test)]
mod edge_case_tests;

// Apply state machine
pub use apply::{
    decide, ApplyOutcome, AttemptFacts, Decision, EventFacts, OrderFacts, WebhookApplier,
    WebhookPipeline,
};

// Claims
pub use claims::ClaimCoordinator;

// Config
pub use config::{ReconcileConfig, WebhookMode};

// Error
pub use error::{IssueCode, ReconcileError, ReconcileResult};

// Event store
pub use events::{AppliedResult, EventStore, IngestOutcome, WebhookEventRow};

// Inventory
pub use inventory::{InventoryLedger, PgInventoryLedger, RestockReason};

// Orders
pub use orders::{
    payment_transition_allowed, AttemptStatus, OrderRow, OrderStore, PaymentAttemptRow,
    PaymentStatus, Provider,
};

// Payload normalization
pub use payload::{content_hash, event_key, normalize, InvoiceStatus, NormalizedEvent};

// Provider seam
pub use provider::{ProviderApi, ProviderInvoiceState};

// Sweeps
pub use event_drainer::{order_canonically, DrainSummary, StoredEventDrainer};
pub use orphan_expirer::{OrphanExpirer, OrphanSweepSummary};
pub use review_reporter::{NeedsReviewReporter, ReasonCount, ReviewBacklogReport};
pub use stale_reconciler::{StaleActiveReconciler, StaleSweepSummary};

use std::sync::Arc;

use sqlx::PgPool;

/// Everything the worker binary wires up, in one place.
pub struct Reconciler {
    pub pipeline: WebhookPipeline,
    pub stale: StaleActiveReconciler,
    pub orphans: OrphanExpirer,
    /// Present only when the deployment buffers events (`store` mode).
    pub drainer: Option<StoredEventDrainer>,
    pub reporter: NeedsReviewReporter,
}

impl Reconciler {
    pub fn new(
        pool: PgPool,
        config: ReconcileConfig,
        provider: Arc<dyn ProviderApi>,
        ledger: Arc<dyn InventoryLedger>,
    ) -> Self {
        let drainer = match config.mode {
            WebhookMode::Store => {
                StoredEventDrainer::new(pool.clone(), config.clone(), ledger.clone()).ok()
            }
            _ => None,
        };

        Self {
            pipeline: WebhookPipeline::new(pool.clone(), &config, ledger.clone()),
            stale: StaleActiveReconciler::new(pool.clone(), config.clone(), provider, ledger.clone()),
            orphans: OrphanExpirer::new(pool.clone(), config.clone(), ledger),
            drainer,
            reporter: NeedsReviewReporter::new(pool, config.review_age_hours),
        }
    }
}
