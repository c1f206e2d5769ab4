//! Per-viewer payment sessions.
//!
//! A session tracks liveness (last ping), invoicing cadence (last invoice)
//! and the ordered invoice history split into disjoint paid/unpaid lists.
//! Health is a pure query over the unpaid count; staleness is derived from
//! ping age at query time and never stored.
//!
//! The registry is shared between the HTTP handlers (reader + lifecycle
//! writer) and the payment reconciler (writer). Every mutation happens
//! inside a single lock hold with no await point, so partially-updated
//! sessions are never observable.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Session lookup errors. Queries on a missing viewer always fail loudly;
/// there is no implicit empty session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("viewer {0} does not have a session")]
    NotFound(String),
}

/// Settlement metadata attached to an invoice once the provider reports it
/// paid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentInfo {
    pub status: String,
    pub confirmed_at: DateTime<Utc>,
}

/// A single micro-invoice. Immutable once created except for the one-way
/// unpaid -> paid transition recorded via `payment_info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invoice {
    /// Monotonically increasing per-session sequence number, starting at 1.
    pub seq: u64,
    /// Provider-issued invoice id.
    pub id: String,
    /// Invoice amount in sats; `amount` on the wire.
    #[serde(rename = "amount")]
    pub amount_sats: u64,
    pub created_at: DateTime<Utc>,
    /// Opaque BOLT-11 payment request the viewer's wallet settles.
    pub request: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_info: Option<PaymentInfo>,
}

/// Point-in-time summary returned to the session-lifecycle endpoints.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub viewer_name: String,
    pub created_at: DateTime<Utc>,
    pub invoice_count: u64,
}

/// Health snapshot for the access gate.
#[derive(Debug, Clone, Copy)]
pub struct SessionHealth {
    pub healthy: bool,
    pub unpaid: usize,
}

/// Snapshot the reconciler works from so it never holds the registry lock
/// across a provider call.
#[derive(Debug, Clone)]
pub struct ReconcileView {
    pub last_pinged_at: DateTime<Utc>,
    pub last_invoiced_at: DateTime<Utc>,
    pub invoice_count: u64,
    pub unpaid_ids: Vec<String>,
    pub healthy: bool,
}

struct ViewerSession {
    created_at: DateTime<Utc>,
    last_pinged_at: DateTime<Utc>,
    last_invoiced_at: DateTime<Utc>,
    invoices: Vec<Invoice>,
    paid_invoices: Vec<Invoice>,
    unpaid_invoices: Vec<Invoice>,
}

impl ViewerSession {
    fn new(now: DateTime<Utc>) -> Self {
        ViewerSession {
            created_at: now,
            last_pinged_at: now,
            last_invoiced_at: now,
            invoices: Vec::new(),
            paid_invoices: Vec::new(),
            unpaid_invoices: Vec::new(),
        }
    }

    fn is_healthy(&self, unhealthy_invoice_count: usize) -> bool {
        self.unpaid_invoices.len() < unhealthy_invoice_count
    }
}

/// Shared registry of viewer sessions, keyed by viewer name.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, ViewerSession>>>,
    unhealthy_invoice_count: usize,
}

impl SessionRegistry {
    pub fn new(unhealthy_invoice_count: usize) -> Self {
        SessionRegistry {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            unhealthy_invoice_count,
        }
    }

    /// Idempotent create-or-fetch. Repeated starts return the existing
    /// session untouched.
    pub async fn start_session(&self, viewer: &str, now: DateTime<Utc>) -> SessionInfo {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(viewer.to_string())
            .or_insert_with(|| ViewerSession::new(now));
        SessionInfo {
            viewer_name: viewer.to_string(),
            created_at: session.created_at,
            invoice_count: session.invoices.len() as u64,
        }
    }

    pub async fn stop_session(&self, viewer: &str) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().await;
        sessions
            .remove(viewer)
            .map(|_| ())
            .ok_or_else(|| SessionError::NotFound(viewer.to_string()))
    }

    /// Viewer keep-alive.
    pub async fn ping(&self, viewer: &str, now: DateTime<Utc>) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(viewer)
            .ok_or_else(|| SessionError::NotFound(viewer.to_string()))?;
        session.last_pinged_at = now;
        Ok(())
    }

    /// Record a freshly issued invoice: appended to the ordered history and
    /// the unpaid list. An invoice round-trip counts as liveness, and the
    /// issuance timestamp gates the next due check.
    pub async fn append_invoice(
        &self,
        viewer: &str,
        invoice: Invoice,
        now: DateTime<Utc>,
    ) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(viewer)
            .ok_or_else(|| SessionError::NotFound(viewer.to_string()))?;
        session.last_pinged_at = now;
        session.last_invoiced_at = now;
        session.unpaid_invoices.push(invoice.clone());
        session.invoices.push(invoice);
        Ok(())
    }

    /// Move one invoice from unpaid to paid. Returns `false` without
    /// touching anything if the invoice is not in the unpaid list (already
    /// paid, or unknown), so a paid invoice is never duplicated.
    pub async fn mark_paid(
        &self,
        viewer: &str,
        invoice_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, SessionError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(viewer)
            .ok_or_else(|| SessionError::NotFound(viewer.to_string()))?;

        let Some(pos) = session
            .unpaid_invoices
            .iter()
            .position(|inv| inv.id == invoice_id)
        else {
            return Ok(false);
        };

        let mut invoice = session.unpaid_invoices.remove(pos);
        let info = PaymentInfo {
            status: "completed".to_string(),
            confirmed_at: now,
        };
        invoice.payment_info = Some(info.clone());
        session.paid_invoices.push(invoice);
        if let Some(inv) = session.invoices.iter_mut().find(|inv| inv.id == invoice_id) {
            inv.payment_info = Some(info);
        }
        Ok(true)
    }

    /// Health is a strict `<` on the unpaid count: reaching the threshold
    /// flips a session unhealthy, exceeding it is not required.
    pub async fn health(&self, viewer: &str) -> Result<SessionHealth, SessionError> {
        let sessions = self.sessions.read().await;
        let session = sessions
            .get(viewer)
            .ok_or_else(|| SessionError::NotFound(viewer.to_string()))?;
        Ok(SessionHealth {
            healthy: session.is_healthy(self.unhealthy_invoice_count),
            unpaid: session.unpaid_invoices.len(),
        })
    }

    pub async fn is_healthy(&self, viewer: &str) -> Result<bool, SessionError> {
        Ok(self.health(viewer).await?.healthy)
    }

    pub async fn contains(&self, viewer: &str) -> bool {
        self.sessions.read().await.contains_key(viewer)
    }

    pub async fn viewer_names(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// All invoices in sequence order.
    pub async fn all_invoices(&self, viewer: &str) -> Result<Vec<Invoice>, SessionError> {
        let sessions = self.sessions.read().await;
        let session = sessions
            .get(viewer)
            .ok_or_else(|| SessionError::NotFound(viewer.to_string()))?;
        Ok(session.invoices.clone())
    }

    pub async fn paid_invoices(&self, viewer: &str) -> Result<Vec<Invoice>, SessionError> {
        let sessions = self.sessions.read().await;
        let session = sessions
            .get(viewer)
            .ok_or_else(|| SessionError::NotFound(viewer.to_string()))?;
        Ok(session.paid_invoices.clone())
    }

    pub async fn unpaid_invoices(&self, viewer: &str) -> Result<Vec<Invoice>, SessionError> {
        let sessions = self.sessions.read().await;
        let session = sessions
            .get(viewer)
            .ok_or_else(|| SessionError::NotFound(viewer.to_string()))?;
        Ok(session.unpaid_invoices.clone())
    }

    pub async fn reconcile_view(&self, viewer: &str) -> Result<ReconcileView, SessionError> {
        let sessions = self.sessions.read().await;
        let session = sessions
            .get(viewer)
            .ok_or_else(|| SessionError::NotFound(viewer.to_string()))?;
        Ok(ReconcileView {
            last_pinged_at: session.last_pinged_at,
            last_invoiced_at: session.last_invoiced_at,
            invoice_count: session.invoices.len() as u64,
            unpaid_ids: session
                .unpaid_invoices
                .iter()
                .map(|inv| inv.id.clone())
                .collect(),
            healthy: session.is_healthy(self.unhealthy_invoice_count),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invoice(seq: u64, id: &str) -> Invoice {
        Invoice {
            seq,
            id: id.to_string(),
            amount_sats: 10,
            created_at: Utc::now(),
            request: format!("lnbc-test-{seq}"),
            payment_info: None,
        }
    }

    #[test]
    fn test_invoice_wire_field_names() {
        let mut inv = invoice(1, "inv-1");
        let json = serde_json::to_value(&inv).unwrap();
        assert!(json.get("seq").is_some());
        assert!(json.get("id").is_some());
        assert_eq!(json.get("amount").and_then(|v| v.as_u64()), Some(10));
        assert!(json.get("createdAt").is_some());
        assert!(json.get("request").is_some());
        // paymentInfo is omitted until settlement, then camelCase
        assert!(json.get("paymentInfo").is_none());

        inv.payment_info = Some(PaymentInfo {
            status: "completed".to_string(),
            confirmed_at: Utc::now(),
        });
        let json = serde_json::to_value(&inv).unwrap();
        assert!(json["paymentInfo"].get("confirmedAt").is_some());
    }

    #[tokio::test]
    async fn test_start_session_idempotent() {
        let registry = SessionRegistry::new(1);
        let now = Utc::now();
        let first = registry.start_session("v1", now).await;
        registry
            .append_invoice("v1", invoice(1, "inv-1"), now)
            .await
            .unwrap();

        let again = registry.start_session("v1", Utc::now()).await;
        assert_eq!(again.created_at, first.created_at);
        assert_eq!(again.invoice_count, 1);
    }

    #[tokio::test]
    async fn test_queries_on_missing_viewer_fail() {
        let registry = SessionRegistry::new(1);
        assert!(matches!(
            registry.ping("ghost", Utc::now()).await,
            Err(SessionError::NotFound(_))
        ));
        assert!(matches!(
            registry.health("ghost").await,
            Err(SessionError::NotFound(_))
        ));
        assert!(matches!(
            registry.stop_session("ghost").await,
            Err(SessionError::NotFound(_))
        ));
        assert!(matches!(
            registry.all_invoices("ghost").await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_health_boundary_at_threshold() {
        let registry = SessionRegistry::new(1);
        let now = Utc::now();
        registry.start_session("v1", now).await;

        // 0 unpaid < 1: healthy
        assert!(registry.is_healthy("v1").await.unwrap());

        // exactly at the threshold flips health, no exceeding required
        registry
            .append_invoice("v1", invoice(1, "inv-1"), now)
            .await
            .unwrap();
        let health = registry.health("v1").await.unwrap();
        assert!(!health.healthy);
        assert_eq!(health.unpaid, 1);
    }

    #[tokio::test]
    async fn test_mark_paid_moves_exactly_one() {
        let registry = SessionRegistry::new(1);
        let now = Utc::now();
        registry.start_session("v1", now).await;
        registry
            .append_invoice("v1", invoice(1, "inv-1"), now)
            .await
            .unwrap();

        assert!(registry.mark_paid("v1", "inv-1", now).await.unwrap());
        assert!(registry.is_healthy("v1").await.unwrap());
        assert_eq!(registry.paid_invoices("v1").await.unwrap().len(), 1);
        assert!(registry.unpaid_invoices("v1").await.unwrap().is_empty());

        // second report is a no-op and must not duplicate the paid entry
        assert!(!registry.mark_paid("v1", "inv-1", now).await.unwrap());
        assert_eq!(registry.paid_invoices("v1").await.unwrap().len(), 1);

        // the ordered history carries the settlement metadata
        let all = registry.all_invoices("v1").await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].payment_info.is_some());
    }

    #[tokio::test]
    async fn test_append_invoice_refreshes_liveness_and_due_time() {
        let registry = SessionRegistry::new(1);
        let start = Utc::now();
        registry.start_session("v1", start).await;

        let later = start + chrono::Duration::seconds(42);
        registry
            .append_invoice("v1", invoice(1, "inv-1"), later)
            .await
            .unwrap();

        let view = registry.reconcile_view("v1").await.unwrap();
        assert_eq!(view.last_pinged_at, later);
        assert_eq!(view.last_invoiced_at, later);
        assert_eq!(view.invoice_count, 1);
        assert_eq!(view.unpaid_ids, vec!["inv-1".to_string()]);
    }
}
