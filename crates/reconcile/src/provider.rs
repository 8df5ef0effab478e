//! Seam to the acquirer's status API.
//!
//! The engine never talks HTTP itself; the worker binary supplies the
//! concrete client. Only the invoice status lookup is needed — invoice
//! creation and checkout live in the storefront, outside this engine.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{ReconcileError, ReconcileResult};
use crate::payload::first_str;

/// Current provider-side state of one invoice.
#[derive(Debug, Clone)]
pub struct ProviderInvoiceState {
    pub invoice_ref: String,
    pub status: String,
    /// The provider's full response object; carries amount, currency and
    /// modification time in whatever field names that API revision uses.
    pub raw: Value,
}

impl ProviderInvoiceState {
    /// Build from a raw status response, rejecting responses the engine
    /// could not act on.
    pub fn from_raw(raw: Value) -> ReconcileResult<Self> {
        let invoice_ref = first_str(&raw, &["invoiceId", "invoice_id"])
            .ok_or_else(|| ReconcileError::Provider("status response missing invoice id".to_string()))?;
        let status = first_str(&raw, &["status", "invoiceStatus"])
            .ok_or_else(|| ReconcileError::Provider("status response missing status".to_string()))?;

        Ok(Self {
            invoice_ref,
            status,
            raw,
        })
    }
}

#[async_trait]
pub trait ProviderApi: Send + Sync {
    async fn invoice_status(&self, invoice_ref: &str) -> ReconcileResult<ProviderInvoiceState>;
}
