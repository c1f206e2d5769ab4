//! Periodic payment reconciliation.
//!
//! One task, one tick at a time. Each tick walks every known session and,
//! in order: applies settlements the provider reports, then decides whether
//! a new invoice is due. Stale viewers and unhealthy viewers receive no new
//! invoices, but their settlements are still applied so they can recover.
//!
//! Ticks never overlap: the loop drives a `tokio::time::interval` with
//! `MissedTickBehavior::Delay` and runs each tick to completion before
//! awaiting the next, so two ticks can never both pass the due check and
//! double-issue an invoice for the same interval. Per-session failures are
//! logged and skipped; one bad session or provider call never aborts the
//! tick for the others.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::payment::{PaymentProvider, ProviderError};
use super::session::{Invoice, SessionError, SessionRegistry};

#[derive(Debug, thiserror::Error)]
enum ReconcileError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Invoice cadence settings for the reconciler.
#[derive(Debug, Clone, Copy)]
pub struct ReconcilerSettings {
    /// Minimum gap between two invoices for the same viewer.
    pub invoice_interval: Duration,
    /// Ping age beyond which no new invoices are issued.
    pub stale_timeout: Duration,
    pub sats_per_invoice: u64,
}

pub struct PaymentReconciler {
    registry: SessionRegistry,
    provider: Arc<dyn PaymentProvider>,
    invoice_interval: chrono::Duration,
    stale_timeout: chrono::Duration,
    sats_per_invoice: u64,
}

impl PaymentReconciler {
    pub fn new(
        registry: SessionRegistry,
        provider: Arc<dyn PaymentProvider>,
        settings: ReconcilerSettings,
    ) -> Self {
        PaymentReconciler {
            registry,
            provider,
            invoice_interval: chrono::Duration::from_std(settings.invoice_interval)
                .unwrap_or(chrono::Duration::MAX),
            stale_timeout: chrono::Duration::from_std(settings.stale_timeout)
                .unwrap_or(chrono::Duration::MAX),
            sats_per_invoice: settings.sats_per_invoice,
        }
    }

    /// One full reconciliation pass over every known session.
    ///
    /// `now` is passed in rather than sampled so the cadence logic is
    /// testable without waiting on wall-clock time.
    pub async fn run_tick(&self, now: DateTime<Utc>) {
        for viewer in self.registry.viewer_names().await {
            match self.reconcile_viewer(&viewer, now).await {
                Ok(()) => {}
                // session stopped while the tick was mid-flight
                Err(ReconcileError::Session(SessionError::NotFound(_))) => {
                    debug!("Session {} vanished mid-tick, skipping", viewer);
                }
                Err(e) => {
                    error!("Reconciliation failed for viewer {}: {}", viewer, e);
                }
            }
        }
    }

    async fn reconcile_viewer(
        &self,
        viewer: &str,
        now: DateTime<Utc>,
    ) -> Result<(), ReconcileError> {
        // settlements first, and regardless of staleness or health, so a
        // viewer who pays up can recover
        let view = self.registry.reconcile_view(viewer).await?;
        for invoice_id in &view.unpaid_ids {
            match self.provider.check_invoice_paid(invoice_id).await {
                Ok(true) => {
                    if self.registry.mark_paid(viewer, invoice_id, now).await? {
                        info!("Invoice {} settled for viewer {}", invoice_id, viewer);
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        "Status check for invoice {} (viewer {}) failed: {}",
                        invoice_id, viewer, e
                    );
                }
            }
        }

        // re-read: the settlements above may have restored health
        let view = self.registry.reconcile_view(viewer).await?;
        if now.signed_duration_since(view.last_pinged_at) > self.stale_timeout {
            warn!("Viewer {} is stale, not issuing an invoice", viewer);
            return Ok(());
        }
        if !view.healthy {
            warn!("Viewer {} is unhealthy, not issuing an invoice", viewer);
            return Ok(());
        }
        if now.signed_duration_since(view.last_invoiced_at) < self.invoice_interval {
            return Ok(());
        }

        let seq = view.invoice_count + 1;
        let internal_id = format!("{viewer}-{seq}");
        let created = self
            .provider
            .create_invoice(
                self.sats_per_invoice,
                &internal_id,
                &format!("stream access for {viewer}"),
            )
            .await?;

        let invoice = Invoice {
            seq,
            id: created.id.clone(),
            amount_sats: self.sats_per_invoice,
            created_at: now,
            request: created.payment_request,
            payment_info: None,
        };
        self.registry.append_invoice(viewer, invoice, now).await?;
        info!(
            "Issued invoice {} (seq {}) to viewer {}",
            created.id, seq, viewer
        );
        Ok(())
    }

    /// Drive `run_tick` on a fixed timer. Single-flight by construction:
    /// the next tick is not awaited until the current one completes.
    pub fn spawn(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.run_tick(Utc::now()).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::payment::{CreatedInvoice, MemoryProvider};
    use async_trait::async_trait;

    fn reconciler_with(
        registry: &SessionRegistry,
        provider: Arc<dyn PaymentProvider>,
        invoice_interval_ms: u64,
        stale_timeout_ms: u64,
    ) -> PaymentReconciler {
        PaymentReconciler::new(
            registry.clone(),
            provider,
            ReconcilerSettings {
                invoice_interval: Duration::from_millis(invoice_interval_ms),
                stale_timeout: Duration::from_millis(stale_timeout_ms),
                sats_per_invoice: 10,
            },
        )
    }

    #[tokio::test]
    async fn test_issues_invoice_when_due() {
        let registry = SessionRegistry::new(1);
        let provider = Arc::new(MemoryProvider::new());
        let reconciler = reconciler_with(&registry, provider, 0, 60_000);

        let now = Utc::now();
        registry.start_session("v1", now).await;
        reconciler.run_tick(now).await;

        let invoices = registry.all_invoices("v1").await.unwrap();
        assert_eq!(invoices.len(), 1);
        assert_eq!(invoices[0].seq, 1);
        assert_eq!(invoices[0].amount_sats, 10);
        assert!(invoices[0].id.contains("v1-1"));
    }

    #[tokio::test]
    async fn test_no_duplicate_issuance_within_interval() {
        let registry = SessionRegistry::new(10);
        let provider = Arc::new(MemoryProvider::new());
        let reconciler = reconciler_with(&registry, provider, 30_000, 600_000);

        let start = Utc::now() - chrono::Duration::seconds(60);
        registry.start_session("v1", start).await;

        // first tick 31s after session start: one invoice due
        let t1 = start + chrono::Duration::seconds(31);
        reconciler.run_tick(t1).await;
        // second tick 10s later: inside the interval, nothing due
        let t2 = t1 + chrono::Duration::seconds(10);
        reconciler.run_tick(t2).await;

        assert_eq!(registry.all_invoices("v1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_viewer_gets_no_invoice_but_settlements_apply() {
        let registry = SessionRegistry::new(1);
        let provider = Arc::new(MemoryProvider::new());
        let reconciler =
            reconciler_with(&registry, provider.clone() as Arc<dyn PaymentProvider>, 0, 5_000);

        let start = Utc::now();
        registry.start_session("v1", start).await;

        // first tick issues the invoice
        reconciler.run_tick(start).await;
        let unpaid = registry.unpaid_invoices("v1").await.unwrap();
        assert_eq!(unpaid.len(), 1);

        // viewer pays but goes quiet past the stale timeout
        provider.settle(&unpaid[0].id);
        let much_later = start + chrono::Duration::seconds(120);
        reconciler.run_tick(much_later).await;

        // settlement applied, but no new invoice despite being due and healthy
        assert!(registry.is_healthy("v1").await.unwrap());
        assert_eq!(registry.all_invoices("v1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unhealthy_viewer_gets_no_invoice() {
        let registry = SessionRegistry::new(1);
        let provider = Arc::new(MemoryProvider::new());
        let reconciler = reconciler_with(&registry, provider, 0, 600_000);

        let now = Utc::now();
        registry.start_session("v1", now).await;
        reconciler.run_tick(now).await;
        assert_eq!(registry.all_invoices("v1").await.unwrap().len(), 1);

        // still one unpaid invoice: unhealthy, so the next due tick is skipped
        reconciler.run_tick(now + chrono::Duration::seconds(5)).await;
        assert_eq!(registry.all_invoices("v1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_settlement_restores_issuance() {
        let registry = SessionRegistry::new(1);
        let provider = Arc::new(MemoryProvider::new());
        let reconciler =
            reconciler_with(&registry, provider.clone() as Arc<dyn PaymentProvider>, 0, 600_000);

        let now = Utc::now();
        registry.start_session("v1", now).await;
        reconciler.run_tick(now).await;

        let unpaid = registry.unpaid_invoices("v1").await.unwrap();
        provider.settle(&unpaid[0].id);

        // same tick applies the settlement and issues the next invoice
        reconciler.run_tick(now + chrono::Duration::seconds(1)).await;
        let all = registry.all_invoices("v1").await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].seq, 2);
    }

    struct FailingProvider;

    #[async_trait]
    impl PaymentProvider for FailingProvider {
        async fn create_invoice(
            &self,
            _amount_sats: u64,
            internal_id: &str,
            _description: &str,
        ) -> Result<CreatedInvoice, ProviderError> {
            if internal_id.starts_with("bad-") {
                return Err(ProviderError::Api {
                    status: 500,
                    message: "provider exploded".to_string(),
                });
            }
            Ok(CreatedInvoice {
                id: internal_id.to_string(),
                payment_request: format!("lnmem:{internal_id}"),
            })
        }

        async fn check_invoice_paid(&self, _invoice_id: &str) -> Result<bool, ProviderError> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_one_failing_session_does_not_block_others() {
        let registry = SessionRegistry::new(10);
        let reconciler = reconciler_with(&registry, Arc::new(FailingProvider), 0, 600_000);

        let now = Utc::now();
        registry.start_session("bad-viewer", now).await;
        registry.start_session("good-viewer", now).await;
        reconciler.run_tick(now).await;

        assert!(registry.all_invoices("bad-viewer").await.unwrap().is_empty());
        assert_eq!(registry.all_invoices("good-viewer").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_session_stopped_mid_tick_is_silent() {
        let registry = SessionRegistry::new(1);
        let provider = Arc::new(MemoryProvider::new());
        let reconciler = reconciler_with(&registry, provider, 0, 600_000);

        let now = Utc::now();
        registry.start_session("v1", now).await;
        registry.stop_session("v1").await.unwrap();

        // the viewer-names snapshot can still name a stopped session; the
        // per-viewer pass reports it as NotFound and run_tick skips silently
        let result = reconciler.reconcile_viewer("v1", now).await;
        assert!(matches!(
            result,
            Err(ReconcileError::Session(SessionError::NotFound(_)))
        ));
        reconciler.run_tick(now).await;
        assert_eq!(registry.session_count().await, 0);
    }
}
