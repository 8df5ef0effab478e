//! Operator-facing needs-review backlog report.
//!
//! Read-only: counts the events whose order is parked in `needs_review`
//! past the age threshold, the oldest backlog age, and the most frequent
//! failure reasons. Applies no state; the log line is the deliverable.

use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::error::ReconcileResult;

#[derive(Debug, Clone, Serialize)]
pub struct ReviewBacklogReport {
    pub generated_at: OffsetDateTime,
    pub threshold_hours: i64,
    /// Events linked to orders stuck in needs_review past the threshold.
    pub backlog: i64,
    pub oldest_age_secs: Option<i64>,
    /// Top failure reasons, most frequent first, at most three.
    pub top_reasons: Vec<ReasonCount>,
    /// Unapplied events sitting under an expired claim — a worker died
    /// mid-processing and nothing has picked the row back up yet.
    pub stuck_claims: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReasonCount {
    pub reason: String,
    pub hits: i64,
}

pub struct NeedsReviewReporter {
    pool: PgPool,
    threshold_hours: i64,
}

impl NeedsReviewReporter {
    pub fn new(pool: PgPool, threshold_hours: i64) -> Self {
        Self {
            pool,
            threshold_hours,
        }
    }

    pub async fn run(&self) -> ReconcileResult<ReviewBacklogReport> {
        let (backlog, oldest): (i64, Option<OffsetDateTime>) = sqlx::query_as(
            r#"
            SELECT COUNT(*)::BIGINT, MIN(o.updated_at)
            FROM webhook_events e
            JOIN orders o ON o.id = e.order_id
            WHERE o.payment_status = 'needs_review'
              AND o.updated_at < NOW() - ($1 || ' hours')::INTERVAL
            "#,
        )
        .bind(self.threshold_hours)
        .fetch_one(&self.pool)
        .await?;

        let top_reasons: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT COALESCE(e.applied_error_code, 'unspecified'), COUNT(*)::BIGINT AS hits
            FROM webhook_events e
            JOIN orders o ON o.id = e.order_id
            WHERE o.payment_status = 'needs_review'
              AND o.updated_at < NOW() - ($1 || ' hours')::INTERVAL
            GROUP BY 1
            ORDER BY hits DESC, 1 ASC
            LIMIT 3
            "#,
        )
        .bind(self.threshold_hours)
        .fetch_all(&self.pool)
        .await?;

        let (stuck_claims,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)::BIGINT
            FROM webhook_events
            WHERE claim_expires_at IS NOT NULL
              AND claim_expires_at < NOW()
              AND applied_at IS NULL
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let generated_at = OffsetDateTime::now_utc();
        let report = ReviewBacklogReport {
            generated_at,
            threshold_hours: self.threshold_hours,
            backlog,
            oldest_age_secs: oldest.map(|t| (generated_at - t).whole_seconds()),
            top_reasons: top_reasons
                .into_iter()
                .map(|(reason, hits)| ReasonCount { reason, hits })
                .collect(),
            stuck_claims,
        };

        tracing::info!(
            backlog = report.backlog,
            oldest_age_secs = ?report.oldest_age_secs,
            stuck_claims = report.stuck_claims,
            top_reasons = ?report
                .top_reasons
                .iter()
                .map(|r| format!("{}={}", r.reason, r.hits))
                .collect::<Vec<_>>(),
            "Needs-review backlog report"
        );

        Ok(report)
    }
}
