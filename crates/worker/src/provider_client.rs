//! HTTP client for the acquirer's invoice status endpoint.
//!
//! Only the status lookup the stale-attempt sweep needs; invoice creation
//! and checkout live in the storefront service. Transport failures get one
//! short exponential-backoff retry; HTTP-level errors do not, since the
//! sweep already tolerates per-item failure and will re-poll next run.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::Retry;

use kram_reconcile::{ProviderApi, ProviderInvoiceState, ReconcileError, ReconcileResult};

pub struct AcquirerClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl AcquirerClient {
    pub fn from_env() -> anyhow::Result<Self> {
        let base_url = std::env::var("PROVIDER_API_BASE")
            .map_err(|_| anyhow::anyhow!("PROVIDER_API_BASE must be set"))?;
        let token = std::env::var("PROVIDER_API_TOKEN")
            .map_err(|_| anyhow::anyhow!("PROVIDER_API_TOKEN must be set"))?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }
}

#[async_trait]
impl ProviderApi for AcquirerClient {
    async fn invoice_status(&self, invoice_ref: &str) -> ReconcileResult<ProviderInvoiceState> {
        let url = format!(
            "{}/api/merchant/invoice/status?invoiceId={invoice_ref}",
            self.base_url
        );

        let strategy = ExponentialBackoff::from_millis(250).factor(2).take(2);
        let response = Retry::spawn(strategy, || async {
            self.http
                .get(&url)
                .header("X-Token", &self.token)
                .send()
                .await
        })
        .await
        .map_err(|e| ReconcileError::Provider(e.to_string()))?;

        let response = response
            .error_for_status()
            .map_err(|e| ReconcileError::Provider(e.to_string()))?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| ReconcileError::Provider(e.to_string()))?;

        ProviderInvoiceState::from_raw(body)
    }
}
