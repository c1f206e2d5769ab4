//! Lightning payment provider interface.
//!
//! The reconciler only ever needs two operations: create an invoice and ask
//! whether an invoice settled. Everything else about the payment network is
//! opaque, and every provider failure surfaces as a `ProviderError` that the
//! caller treats as transient.
//!
//! `ZbdProvider` talks to the ZBD charges REST API. `MemoryProvider` is a
//! wallet-free stand-in for local development and tests; invoices settle
//! when `settle` is called.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Transient provider failures: logged and retried on the next reconciler
/// tick, never fatal.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("payment provider transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("payment provider rejected request ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("malformed provider response: {0}")]
    Response(String),
}

/// A freshly created invoice as returned by the provider.
#[derive(Debug, Clone)]
pub struct CreatedInvoice {
    /// Provider-side invoice id, used for later status polls.
    pub id: String,
    /// BOLT-11 payment request for the viewer's wallet.
    pub payment_request: String,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Create an invoice for `amount_sats`, tagged with our `internal_id`
    /// so provider-side records can be traced back to a viewer session.
    async fn create_invoice(
        &self,
        amount_sats: u64,
        internal_id: &str,
        description: &str,
    ) -> Result<CreatedInvoice, ProviderError>;

    /// Whether the invoice has settled.
    async fn check_invoice_paid(&self, invoice_id: &str) -> Result<bool, ProviderError>;
}

// ==================== ZBD ====================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateChargeRequest<'a> {
    /// Amount in millisatoshi, as a decimal string per the ZBD API.
    amount: String,
    internal_id: &'a str,
    description: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChargeEnvelope {
    data: Option<ChargeData>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChargeData {
    id: String,
    status: Option<String>,
    invoice: Option<ChargeInvoice>,
}

#[derive(Debug, Deserialize)]
struct ChargeInvoice {
    request: String,
}

/// ZBD charges API client.
pub struct ZbdProvider {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
}

impl ZbdProvider {
    pub fn new(
        api_key: String,
        api_base: String,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(ZbdProvider {
            client,
            api_base,
            api_key,
        })
    }

    async fn parse_charge(&self, response: reqwest::Response) -> Result<ChargeData, ProviderError> {
        let status = response.status();
        let envelope: ChargeEnvelope = response.json().await?;
        if !status.is_success() {
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message: envelope
                    .message
                    .unwrap_or_else(|| "unknown provider error".to_string()),
            });
        }
        envelope
            .data
            .ok_or_else(|| ProviderError::Response("charge response has no data".to_string()))
    }
}

#[async_trait]
impl PaymentProvider for ZbdProvider {
    async fn create_invoice(
        &self,
        amount_sats: u64,
        internal_id: &str,
        description: &str,
    ) -> Result<CreatedInvoice, ProviderError> {
        let body = CreateChargeRequest {
            amount: (amount_sats * 1000).to_string(),
            internal_id,
            description,
        };
        let response = self
            .client
            .post(format!("{}/v0/charges", self.api_base))
            .header("apikey", &self.api_key)
            .json(&body)
            .send()
            .await?;

        let charge = self.parse_charge(response).await?;
        let payment_request = charge
            .invoice
            .map(|inv| inv.request)
            .ok_or_else(|| ProviderError::Response("charge has no invoice request".to_string()))?;
        Ok(CreatedInvoice {
            id: charge.id,
            payment_request,
        })
    }

    async fn check_invoice_paid(&self, invoice_id: &str) -> Result<bool, ProviderError> {
        let response = self
            .client
            .get(format!("{}/v0/charges/{}", self.api_base, invoice_id))
            .header("apikey", &self.api_key)
            .send()
            .await?;

        let charge = self.parse_charge(response).await?;
        Ok(charge.status.as_deref() == Some("completed"))
    }
}

// ==================== In-memory ====================

/// Wallet-free provider for local development and tests. Invoices start
/// unpaid and settle when `settle` is called with the invoice id.
#[derive(Default)]
pub struct MemoryProvider {
    next_id: AtomicU64,
    paid: Mutex<HashSet<String>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark an invoice settled.
    pub fn settle(&self, invoice_id: &str) {
        // the set stays consistent even across a poisoned lock
        self.paid
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(invoice_id.to_string());
    }
}

#[async_trait]
impl PaymentProvider for MemoryProvider {
    async fn create_invoice(
        &self,
        amount_sats: u64,
        internal_id: &str,
        _description: &str,
    ) -> Result<CreatedInvoice, ProviderError> {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        Ok(CreatedInvoice {
            id: format!("mem-{n}-{internal_id}"),
            payment_request: format!("lnmem:{internal_id}:{amount_sats}"),
        })
    }

    async fn check_invoice_paid(&self, invoice_id: &str) -> Result<bool, ProviderError> {
        Ok(self
            .paid
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains(invoice_id))
    }
}
