//! Normalization of acquirer webhook payloads.
//!
//! The provider has renamed fields across API revisions (`modifiedDate` vs
//! `modifiedAt`, `ccy` vs `currency`), so extraction probes the known
//! variants instead of deserializing into one fixed shape. Only the
//! normalized, typed value crosses into the state machine; the raw payload
//! is kept verbatim on the audit row.

use serde_json::Value;
use sha2::{Digest, Sha256};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::{ReconcileError, ReconcileResult};

/// Provider-reported invoice status, normalized to the set the engine acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceStatus {
    Created,
    Processing,
    Hold,
    Success,
    Failure,
    Expired,
    Reversed,
    Unknown,
}

impl InvoiceStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "created" => InvoiceStatus::Created,
            "processing" => InvoiceStatus::Processing,
            "hold" => InvoiceStatus::Hold,
            "success" => InvoiceStatus::Success,
            "failure" => InvoiceStatus::Failure,
            "expired" => InvoiceStatus::Expired,
            "reversed" => InvoiceStatus::Reversed,
            _ => InvoiceStatus::Unknown,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, InvoiceStatus::Success)
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            InvoiceStatus::Created | InvoiceStatus::Processing | InvoiceStatus::Hold
        )
    }
}

/// One provider notification, reduced to the fields the engine acts on.
#[derive(Debug, Clone)]
pub struct NormalizedEvent {
    /// Stable provider event id, when the provider sends one.
    pub event_id: Option<String>,
    pub invoice_ref: String,
    pub status_raw: String,
    pub status: InvoiceStatus,
    /// Minor units.
    pub amount: Option<i64>,
    /// ISO-4217 numeric code.
    pub currency: Option<i32>,
    /// Merchant-set reference echoed back by the provider (our attempt id).
    pub reference: Option<String>,
    pub modified_at: Option<OffsetDateTime>,
    pub failure_reason: Option<String>,
    pub err_code: Option<String>,
}

/// Extract a normalized event from a raw delivery.
///
/// A payload without an invoice id or status is rejected here, before
/// anything is stored.
pub fn normalize(payload: &Value) -> ReconcileResult<NormalizedEvent> {
    let invoice_ref = first_str(payload, &["invoiceId", "invoice_id", "invoice"])
        .ok_or_else(|| ReconcileError::InvalidPayload("missing invoice id".to_string()))?;
    let status_raw = first_str(payload, &["status", "invoiceStatus"])
        .ok_or_else(|| ReconcileError::InvalidPayload("missing status".to_string()))?;

    let status = InvoiceStatus::parse(&status_raw);
    let amount = first_i64(payload, &["finalAmount", "amount"]);
    let currency = first_i64(payload, &["ccy", "currency"]).map(|v| v as i32);
    let reference = first_str(payload, &["reference", "destination"]);
    let modified_at = first_timestamp(payload, &["modifiedDate", "modified_date", "modifiedAt"]);
    let failure_reason = first_str(payload, &["failureReason", "failure_reason"]);
    let err_code = first_str(payload, &["errCode", "err_code", "errorCode"]);
    let event_id = first_str(payload, &["eventId", "event_id", "webhookId"]);

    Ok(NormalizedEvent {
        event_id,
        invoice_ref,
        status_raw,
        status,
        amount,
        currency,
        reference,
        modified_at,
        failure_reason,
        err_code,
    })
}

/// Idempotency key for one event.
///
/// With a stable provider event id the key is trivially unique. Without one,
/// the key hashes the normalized tuple bucketed to the minute: a resend of
/// an unchanged status inside the same bucket dedups, while a *different*
/// status at the same invoice is a distinct event.
pub fn event_key(event: &NormalizedEvent, received_at: OffsetDateTime) -> String {
    if let Some(id) = &event.event_id {
        return format!("mono:{id}");
    }

    let bucket = event
        .modified_at
        .unwrap_or(received_at)
        .unix_timestamp()
        .div_euclid(60);

    let mut hasher = Sha256::new();
    hasher.update(event.invoice_ref.as_bytes());
    hasher.update(b"|");
    hasher.update(event.status_raw.as_bytes());
    hasher.update(b"|");
    hasher.update(event.amount.unwrap_or(-1).to_be_bytes());
    hasher.update(event.currency.unwrap_or(-1).to_be_bytes());
    hasher.update(b"|");
    hasher.update(event.reference.as_deref().unwrap_or("").as_bytes());
    hasher.update(b"|");
    hasher.update(bucket.to_be_bytes());
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Hash of the raw payload, the dedup fallback when key derivation input
/// differs only in fields we do not normalize.
pub fn content_hash(payload: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

pub(crate) fn first_str(payload: &Value, names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|name| payload.get(name))
        .and_then(Value::as_str)
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty())
}

fn first_i64(payload: &Value, names: &[&str]) -> Option<i64> {
    names.iter().find_map(|name| payload.get(name)).and_then(Value::as_i64)
}

fn first_timestamp(payload: &Value, names: &[&str]) -> Option<OffsetDateTime> {
    let value = names.iter().find_map(|name| payload.get(name))?;
    if let Some(unix) = value.as_i64() {
        return OffsetDateTime::from_unix_timestamp(unix).ok();
    }
    let raw = value.as_str()?;
    OffsetDateTime::parse(raw, &Rfc3339).ok()
}
