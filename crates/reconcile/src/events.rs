//! Durable webhook event store and dedup gate.
//!
//! Every received notification becomes exactly one row in `webhook_events`,
//! keyed by the derived idempotency key. The insert itself is the dedup
//! gate: `INSERT ... ON CONFLICT DO NOTHING RETURNING` either claims a new
//! row or tells us the event was seen before. Rows are never deleted; the
//! table is the audit trail for "what happened to this event".

use serde_json::Value;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{IssueCode, ReconcileError, ReconcileResult};
use crate::payload::{self, NormalizedEvent};

/// Terminal classification of one event's application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppliedResult {
    Applied,
    AppliedNoop,
    AppliedWithIssue,
    Stored,
    Dropped,
    Unmatched,
    Deduped,
}

impl AppliedResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppliedResult::Applied => "applied",
            AppliedResult::AppliedNoop => "applied_noop",
            AppliedResult::AppliedWithIssue => "applied_with_issue",
            AppliedResult::Stored => "stored",
            AppliedResult::Dropped => "dropped",
            AppliedResult::Unmatched => "unmatched",
            AppliedResult::Deduped => "deduped",
        }
    }
}

impl std::fmt::Display for AppliedResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One stored notification.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WebhookEventRow {
    pub id: Uuid,
    pub event_key: String,
    pub invoice_ref: String,
    pub status: String,
    pub amount: Option<i64>,
    pub currency: Option<i32>,
    pub reference: Option<String>,
    pub payload: Value,
    pub payload_hash: String,
    pub provider_modified_at: Option<OffsetDateTime>,
    pub received_at: OffsetDateTime,
    pub applied_at: Option<OffsetDateTime>,
    pub applied_result: Option<String>,
    pub applied_error_code: Option<String>,
    pub applied_error_message: Option<String>,
    pub attempt_id: Option<Uuid>,
    pub order_id: Option<Uuid>,
    pub claimed_at: Option<OffsetDateTime>,
    pub claim_expires_at: Option<OffsetDateTime>,
    pub claimed_by: Option<String>,
}

const EVENT_COLUMNS: &str = "id, event_key, invoice_ref, status, amount, currency, reference, \
     payload, payload_hash, provider_modified_at, received_at, applied_at, applied_result, \
     applied_error_code, applied_error_message, attempt_id, order_id, claimed_at, \
     claim_expires_at, claimed_by";

/// Result of ingesting one raw delivery.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub event: WebhookEventRow,
    pub normalized: NormalizedEvent,
    pub deduped: bool,
}

pub struct EventStore {
    pool: PgPool,
}

impl EventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Normalize, derive the idempotency key and insert-or-ignore.
    ///
    /// Malformed payloads are rejected before any row is written. A
    /// conflicted insert looks the existing row up by key (falling back to
    /// the raw-payload hash) and reports `deduped = true`.
    pub async fn ingest(&self, raw: &Value) -> ReconcileResult<IngestOutcome> {
        let normalized = payload::normalize(raw)?;
        let received_at = OffsetDateTime::now_utc();
        let key = payload::event_key(&normalized, received_at);
        let hash = payload::content_hash(raw);

        // A payload with neither a stable event id nor a provider timestamp
        // keys off the receive-time bucket; the raw-payload hash is the
        // dedup backstop for resends that cross a bucket boundary.
        if normalized.event_id.is_none() && normalized.modified_at.is_none() {
            if let Some(existing) = self.find_by_hash(&hash).await? {
                return Ok(IngestOutcome {
                    event: existing,
                    normalized,
                    deduped: true,
                });
            }
        }

        let inserted: Option<WebhookEventRow> = sqlx::query_as(&format!(
            r#"
            INSERT INTO webhook_events
                (id, event_key, invoice_ref, status, amount, currency, reference,
                 payload, payload_hash, provider_modified_at, received_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW())
            ON CONFLICT (event_key) DO NOTHING
            RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(&key)
        .bind(&normalized.invoice_ref)
        .bind(&normalized.status_raw)
        .bind(normalized.amount)
        .bind(normalized.currency)
        .bind(&normalized.reference)
        .bind(raw)
        .bind(&hash)
        .bind(normalized.modified_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(event) = inserted {
            return Ok(IngestOutcome {
                event,
                normalized,
                deduped: false,
            });
        }

        let existing = match self.find_by_key(&key).await? {
            Some(event) => event,
            None => self
                .find_by_hash(&hash)
                .await?
                .ok_or(ReconcileError::Database(sqlx::Error::RowNotFound))?,
        };

        tracing::info!(
            event_id = %existing.id,
            event_key = %key,
            invoice_ref = %normalized.invoice_ref,
            prior_result = ?existing.applied_result,
            "Duplicate webhook delivery absorbed by event key"
        );

        Ok(IngestOutcome {
            event: existing,
            normalized,
            deduped: true,
        })
    }

    /// Stamp the final outcome onto the audit row.
    ///
    /// The row, not the caller's return value, is the source of truth for
    /// what happened to an event; a retried delivery re-reads it.
    pub async fn mark_outcome(
        &self,
        event_id: Uuid,
        result: AppliedResult,
        code: Option<IssueCode>,
        message: Option<&str>,
        attempt_id: Option<Uuid>,
        order_id: Option<Uuid>,
    ) -> ReconcileResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_events
            SET applied_result = $2,
                applied_error_code = $3,
                applied_error_message = $4,
                attempt_id = COALESCE($5, attempt_id),
                order_id = COALESCE($6, order_id),
                applied_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(event_id)
        .bind(result.as_str())
        .bind(code.map(|c| c.as_str()))
        .bind(message)
        .bind(attempt_id)
        .bind(order_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Buffered events awaiting replay, oldest first, claimable only.
    pub async fn stored_candidates(&self, limit: i64) -> ReconcileResult<Vec<WebhookEventRow>> {
        let rows: Vec<WebhookEventRow> = sqlx::query_as(&format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM webhook_events
            WHERE applied_result = 'stored'
              AND (claim_expires_at IS NULL OR claim_expires_at < NOW())
            ORDER BY received_at ASC, id ASC
            LIMIT $1
            "#
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn find_by_key(&self, key: &str) -> ReconcileResult<Option<WebhookEventRow>> {
        let row = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM webhook_events WHERE event_key = $1"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn find_by_hash(&self, hash: &str) -> ReconcileResult<Option<WebhookEventRow>> {
        let row = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM webhook_events WHERE payload_hash = $1 ORDER BY received_at ASC LIMIT 1"
        ))
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}
