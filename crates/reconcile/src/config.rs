//! Environment-driven engine configuration.
//!
//! Every tunable is clamped to sane bounds; an unparseable value falls back
//! to the default with a warning instead of refusing to start. The one
//! exception is the webhook mode, where a typo could silently change how
//! money events are handled, so an unknown mode is a hard error.

use std::fmt;
use std::str::FromStr;

use crate::error::{ReconcileError, ReconcileResult};

/// What happens to a webhook delivery after it is durably stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookMode {
    /// Apply inline, synchronously with the delivery.
    Apply,
    /// Buffer for later replay by the stored-event drainer.
    Store,
    /// Record and intentionally discard (load-shedding deployments).
    Drop,
}

impl WebhookMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookMode::Apply => "apply",
            WebhookMode::Store => "store",
            WebhookMode::Drop => "drop",
        }
    }
}

impl FromStr for WebhookMode {
    type Err = ReconcileError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "apply" => Ok(WebhookMode::Apply),
            "store" => Ok(WebhookMode::Store),
            "drop" => Ok(WebhookMode::Drop),
            other => Err(ReconcileError::Config(format!(
                "unknown webhook mode '{other}' (expected apply, store or drop)"
            ))),
        }
    }
}

impl fmt::Display for WebhookMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine tunables, shared by the live pipeline and the sweeps.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub mode: WebhookMode,
    /// Idle time before an active attempt is re-checked against the provider.
    pub stale_grace_secs: i64,
    /// Age after which an attempt with no provider invoice is expired.
    pub orphan_ttl_secs: i64,
    /// Claim lease duration; expiry is the crash-recovery path.
    pub lease_secs: i64,
    /// Needs-review backlog age threshold for the reporter.
    pub review_age_hours: i64,
    /// Upper bound on rows touched per sweep run.
    pub sweep_batch: i64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            mode: WebhookMode::Apply,
            stale_grace_secs: 900,
            orphan_ttl_secs: 120,
            lease_secs: 120,
            review_age_hours: 24,
            sweep_batch: 50,
        }
    }
}

impl ReconcileConfig {
    pub fn from_env() -> ReconcileResult<Self> {
        let mode = match std::env::var("RECONCILE_WEBHOOK_MODE") {
            Ok(raw) => raw.parse()?,
            Err(_) => WebhookMode::Apply,
        };

        Ok(Self {
            mode,
            stale_grace_secs: env_clamped("RECONCILE_STALE_GRACE_SECS", 900, 60, 7200),
            orphan_ttl_secs: env_clamped("RECONCILE_ORPHAN_TTL_SECS", 120, 30, 3600),
            lease_secs: env_clamped("RECONCILE_LEASE_SECS", 120, 10, 900),
            review_age_hours: env_clamped("RECONCILE_REVIEW_AGE_HOURS", 24, 1, 168),
            sweep_batch: env_clamped("RECONCILE_SWEEP_BATCH", 50, 1, 500),
        })
    }
}

fn env_clamped(name: &str, default: i64, min: i64, max: i64) -> i64 {
    let raw = match std::env::var(name) {
        Ok(raw) => raw,
        Err(_) => return default,
    };

    match raw.parse::<i64>() {
        Ok(value) => {
            let clamped = value.clamp(min, max);
            if clamped != value {
                tracing::warn!(
                    var = name,
                    value = value,
                    clamped = clamped,
                    "Config value outside sane bounds, clamping"
                );
            }
            clamped
        }
        Err(_) => {
            tracing::warn!(
                var = name,
                raw = %raw,
                default = default,
                "Unparseable config value, using default"
            );
            default
        }
    }
}
