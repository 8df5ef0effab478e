//! Orders, payment attempts, and the conditional-update primitives that
//! mutate them.
//!
//! Every mutation that matters is "update row W where predicate P"; the
//! caller inspects `rows_affected` to learn whether it won the race. No
//! path re-derives current state from a stale in-memory read.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::ReconcileResult;

/// Payment provider owning an order's payment flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Mono,
    Stripe,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Mono => "mono",
            Provider::Stripe => "stripe",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "mono" => Some(Provider::Mono),
            "stripe" => Some(Provider::Stripe),
            _ => None,
        }
    }

    /// ISO alpha code the provider settles in.
    pub fn native_currency_alpha(&self) -> &'static str {
        match self {
            Provider::Mono => "UAH",
            Provider::Stripe => "USD",
        }
    }

    /// ISO-4217 numeric code the provider reports amounts in.
    pub fn native_currency_numeric(&self) -> i32 {
        match self {
            Provider::Mono => 980,
            Provider::Stripe => 840,
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order payment state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStatus {
    Pending,
    RequiresPayment,
    Paid,
    Failed,
    Refunded,
    NeedsReview,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::RequiresPayment => "requires_payment",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
            PaymentStatus::NeedsReview => "needs_review",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(PaymentStatus::Pending),
            "requires_payment" => Some(PaymentStatus::RequiresPayment),
            "paid" => Some(PaymentStatus::Paid),
            "failed" => Some(PaymentStatus::Failed),
            "refunded" => Some(PaymentStatus::Refunded),
            "needs_review" => Some(PaymentStatus::NeedsReview),
            _ => None,
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payment attempt lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptStatus {
    Creating,
    Active,
    Succeeded,
    Failed,
    Canceled,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Creating => "creating",
            AttemptStatus::Active => "active",
            AttemptStatus::Succeeded => "succeeded",
            AttemptStatus::Failed => "failed",
            AttemptStatus::Canceled => "canceled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "creating" => Some(AttemptStatus::Creating),
            "active" => Some(AttemptStatus::Active),
            "succeeded" => Some(AttemptStatus::Succeeded),
            "failed" => Some(AttemptStatus::Failed),
            "canceled" => Some(AttemptStatus::Canceled),
            _ => None,
        }
    }
}

/// The single allow-list for automatic payment-status transitions.
///
/// `paid` and `needs_review` are absent as a source on purpose: `paid` is
/// terminal, `needs_review` is human-gated. The Stripe flow finalizes its
/// orders outside this engine entirely.
pub fn payment_transition_allowed(provider: Provider, from: PaymentStatus, to: PaymentStatus) -> bool {
    use PaymentStatus::*;

    match provider {
        Provider::Mono => matches!(
            (from, to),
            (Pending, RequiresPayment)
                | (Pending, Paid)
                | (RequiresPayment, Paid)
                | (Pending, Failed)
                | (RequiresPayment, Failed)
                | (Pending, Refunded)
                | (RequiresPayment, Refunded)
                | (Pending, NeedsReview)
                | (RequiresPayment, NeedsReview)
                | (Failed, NeedsReview)
                | (Refunded, NeedsReview)
        ),
        Provider::Stripe => false,
    }
}

/// One purchasable unit under payment.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OrderRow {
    pub id: Uuid,
    pub currency: String,
    pub total_amount: i64,
    pub provider: String,
    pub payment_status: String,
    pub status: String,
    pub inventory_status: String,
    pub provider_charge_ref: Option<String>,
    pub provider_status_reason: Option<String>,
    pub provider_metadata: serde_json::Value,
    pub stock_restored: bool,
    pub stock_restored_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl OrderRow {
    pub fn provider_kind(&self) -> Option<Provider> {
        Provider::parse(&self.provider)
    }

    pub fn payment_state(&self) -> Option<PaymentStatus> {
        PaymentStatus::parse(&self.payment_status)
    }
}

/// One try at paying for an order via one provider.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PaymentAttemptRow {
    pub id: Uuid,
    pub order_id: Uuid,
    pub provider: String,
    pub attempt_no: i32,
    pub status: String,
    pub expected_amount: i64,
    pub provider_invoice_ref: Option<String>,
    pub provider_modified_at: Option<OffsetDateTime>,
    pub last_error_code: Option<String>,
    pub last_error_message: Option<String>,
    pub finalized_at: Option<OffsetDateTime>,
    pub claimed_until: Option<OffsetDateTime>,
    pub claimed_by: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl PaymentAttemptRow {
    pub fn status_kind(&self) -> Option<AttemptStatus> {
        AttemptStatus::parse(&self.status)
    }
}

const ORDER_COLUMNS: &str = "id, currency, total_amount, provider, payment_status, status, \
     inventory_status, provider_charge_ref, provider_status_reason, provider_metadata, \
     stock_restored, stock_restored_at, created_at, updated_at";

const ATTEMPT_COLUMNS: &str = "id, order_id, provider, attempt_no, status, expected_amount, \
     provider_invoice_ref, provider_modified_at, last_error_code, last_error_message, \
     finalized_at, claimed_until, claimed_by, created_at, updated_at";

pub struct OrderStore {
    pool: PgPool,
}

impl OrderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn load_order(&self, order_id: Uuid) -> ReconcileResult<Option<OrderRow>> {
        let row = sqlx::query_as(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"))
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Resolve the attempt a notification belongs to.
    ///
    /// The merchant-set reference (our attempt id, echoed back by the
    /// provider) wins when it parses as one and the row exists; otherwise
    /// fall back to the provider's invoice reference.
    pub async fn resolve_attempt(
        &self,
        reference: Option<&str>,
        invoice_ref: &str,
    ) -> ReconcileResult<Option<PaymentAttemptRow>> {
        if let Some(attempt_id) = reference.and_then(|r| Uuid::parse_str(r).ok()) {
            let by_reference: Option<PaymentAttemptRow> = sqlx::query_as(&format!(
                "SELECT {ATTEMPT_COLUMNS} FROM payment_attempts WHERE id = $1"
            ))
            .bind(attempt_id)
            .fetch_optional(&self.pool)
            .await?;

            if by_reference.is_some() {
                return Ok(by_reference);
            }
        }

        let by_invoice: Option<PaymentAttemptRow> = sqlx::query_as(&format!(
            r#"
            SELECT {ATTEMPT_COLUMNS}
            FROM payment_attempts
            WHERE provider = $1 AND provider_invoice_ref = $2
            ORDER BY attempt_no DESC
            LIMIT 1
            "#
        ))
        .bind(Provider::Mono.as_str())
        .bind(invoice_ref)
        .fetch_optional(&self.pool)
        .await?;

        Ok(by_invoice)
    }

    /// Conditional transition to `paid`. Also stamps the charge reference
    /// and flips the order lifecycle. Returns whether we won the race.
    pub async fn mark_paid(
        &self,
        order_id: Uuid,
        provider: Provider,
        from: PaymentStatus,
        charge_ref: Option<&str>,
    ) -> ReconcileResult<bool> {
        if !payment_transition_allowed(provider, from, PaymentStatus::Paid) {
            return Ok(false);
        }

        let rows = sqlx::query(
            r#"
            UPDATE orders
            SET payment_status = 'paid',
                status = 'paid',
                provider_charge_ref = COALESCE($4, provider_charge_ref),
                provider_status_reason = NULL,
                updated_at = NOW()
            WHERE id = $1 AND provider = $2 AND payment_status = $3
            "#,
        )
        .bind(order_id)
        .bind(provider.as_str())
        .bind(from.as_str())
        .bind(charge_ref)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows > 0)
    }

    /// Conditional transition to `failed` or `refunded`.
    pub async fn mark_payment_failed(
        &self,
        order_id: Uuid,
        provider: Provider,
        from: PaymentStatus,
        to: PaymentStatus,
        reason: Option<&str>,
    ) -> ReconcileResult<bool> {
        if !payment_transition_allowed(provider, from, to) {
            return Ok(false);
        }

        let rows = sqlx::query(
            r#"
            UPDATE orders
            SET payment_status = $4,
                provider_status_reason = $5,
                updated_at = NOW()
            WHERE id = $1 AND provider = $2 AND payment_status = $3
            "#,
        )
        .bind(order_id)
        .bind(provider.as_str())
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(reason)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows > 0)
    }

    /// Park an order for operator review.
    pub async fn park_needs_review(
        &self,
        order_id: Uuid,
        provider: Provider,
        from: PaymentStatus,
        reason: &str,
    ) -> ReconcileResult<bool> {
        if !payment_transition_allowed(provider, from, PaymentStatus::NeedsReview) {
            return Ok(false);
        }

        let rows = sqlx::query(
            r#"
            UPDATE orders
            SET payment_status = 'needs_review',
                provider_status_reason = $4,
                updated_at = NOW()
            WHERE id = $1 AND provider = $2 AND payment_status = $3
            "#,
        )
        .bind(order_id)
        .bind(provider.as_str())
        .bind(from.as_str())
        .bind(reason)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows > 0)
    }

    /// Finalize an attempt, guarded so an already-terminal attempt is never
    /// rewritten. The provider clock only ever moves forward.
    pub async fn finalize_attempt(
        &self,
        attempt_id: Uuid,
        to: AttemptStatus,
        error_code: Option<&str>,
        error_message: Option<&str>,
        provider_modified_at: Option<OffsetDateTime>,
    ) -> ReconcileResult<bool> {
        let rows = sqlx::query(
            r#"
            UPDATE payment_attempts
            SET status = $2,
                last_error_code = $3,
                last_error_message = $4,
                provider_modified_at = CASE
                    WHEN $5::TIMESTAMPTZ IS NOT NULL
                         AND (provider_modified_at IS NULL OR provider_modified_at < $5)
                    THEN $5
                    ELSE provider_modified_at
                END,
                finalized_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status IN ('creating', 'active')
            "#,
        )
        .bind(attempt_id)
        .bind(to.as_str())
        .bind(error_code)
        .bind(error_message)
        .bind(provider_modified_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows > 0)
    }

    /// Advance the attempt's provider clock for a non-final notification.
    pub async fn advance_attempt_clock(
        &self,
        attempt_id: Uuid,
        provider_modified_at: OffsetDateTime,
    ) -> ReconcileResult<bool> {
        let rows = sqlx::query(
            r#"
            UPDATE payment_attempts
            SET provider_modified_at = $2, updated_at = NOW()
            WHERE id = $1
              AND (provider_modified_at IS NULL OR provider_modified_at < $2)
            "#,
        )
        .bind(attempt_id)
        .bind(provider_modified_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows > 0)
    }

    /// Attempts with a provider invoice that have sat in a non-terminal
    /// state past the grace window.
    pub async fn stale_active_candidates(
        &self,
        grace_secs: i64,
        limit: i64,
    ) -> ReconcileResult<Vec<PaymentAttemptRow>> {
        let rows: Vec<PaymentAttemptRow> = sqlx::query_as(&format!(
            r#"
            SELECT {ATTEMPT_COLUMNS}
            FROM payment_attempts
            WHERE provider = $1
              AND status IN ('creating', 'active')
              AND provider_invoice_ref IS NOT NULL
              AND updated_at < NOW() - ($2 || ' seconds')::INTERVAL
            ORDER BY updated_at ASC
            LIMIT $3
            "#
        ))
        .bind(Provider::Mono.as_str())
        .bind(grace_secs)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Attempts that never obtained a provider invoice within the TTL.
    pub async fn orphan_candidates(
        &self,
        ttl_secs: i64,
        limit: i64,
    ) -> ReconcileResult<Vec<PaymentAttemptRow>> {
        let rows: Vec<PaymentAttemptRow> = sqlx::query_as(&format!(
            r#"
            SELECT {ATTEMPT_COLUMNS}
            FROM payment_attempts
            WHERE provider = $1
              AND status = 'creating'
              AND provider_invoice_ref IS NULL
              AND created_at < NOW() - ($2 || ' seconds')::INTERVAL
            ORDER BY created_at ASC
            LIMIT $3
            "#
        ))
        .bind(Provider::Mono.as_str())
        .bind(ttl_secs)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Cancel an orphaned order and fail its attempt in one statement.
    ///
    /// The attempt update is predicated on the order update having matched,
    /// so a race with a concurrently-succeeding webhook can never cancel an
    /// order that just got paid. Returns whether the expiry happened.
    pub async fn expire_orphan(
        &self,
        order_id: Uuid,
        attempt_id: Uuid,
        provider: Provider,
    ) -> ReconcileResult<bool> {
        let rows = sqlx::query(
            r#"
            WITH canceled AS (
                UPDATE orders
                SET payment_status = 'failed',
                    status = 'canceled',
                    provider_status_reason = 'invoice_missing',
                    updated_at = NOW()
                WHERE id = $1
                  AND provider = $2
                  AND payment_status IN ('pending', 'requires_payment')
                  AND status NOT IN ('paid', 'canceled')
                RETURNING id
            )
            UPDATE payment_attempts
            SET status = 'failed',
                last_error_code = 'invoice_missing',
                last_error_message = 'attempt expired before a provider invoice was created',
                finalized_at = NOW(),
                updated_at = NOW()
            WHERE id = $3
              AND status = 'creating'
              AND EXISTS (SELECT 1 FROM canceled)
            "#,
        )
        .bind(order_id)
        .bind(provider.as_str())
        .bind(attempt_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows > 0)
    }
}
