//! Error types and the audit-trail issue taxonomy.

use std::fmt;

/// Result alias used across the reconcile crate.
pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// Failures that propagate to a caller.
///
/// Per-item problems inside a sweep are contained and counted, never raised;
/// the only startup-time error is `ModeMismatch`.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid provider payload: {0}")]
    InvalidPayload(String),

    #[error("provider status request failed: {0}")]
    Provider(String),

    #[error("stored-event drain requires webhook mode 'store', deployment is '{0}'")]
    ModeMismatch(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Outcome classification written onto the webhook event audit row.
///
/// These are stable strings: operator dashboards and the needs-review
/// reporter group by them, so renaming a code is a breaking change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueCode {
    InvalidPayload,
    AttemptNotFound,
    OrderNotFound,
    OutOfOrder,
    AmountMismatch,
    PaymentStateBlocked,
    UnknownStatus,
    DrainApplyFailed,
    InvoiceMissing,
}

impl IssueCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueCode::InvalidPayload => "INVALID_PAYLOAD",
            IssueCode::AttemptNotFound => "ATTEMPT_NOT_FOUND",
            IssueCode::OrderNotFound => "ORDER_NOT_FOUND",
            IssueCode::OutOfOrder => "OUT_OF_ORDER",
            IssueCode::AmountMismatch => "AMOUNT_MISMATCH",
            IssueCode::PaymentStateBlocked => "PAYMENT_STATE_BLOCKED",
            IssueCode::UnknownStatus => "UNKNOWN_STATUS",
            IssueCode::DrainApplyFailed => "JANITOR_JOB3_APPLY_FAILED",
            IssueCode::InvoiceMissing => "invoice_missing",
        }
    }
}

impl fmt::Display for IssueCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
