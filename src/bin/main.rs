use std::sync::Arc;

use log::info;
use tokio::net::TcpListener;

use satstream::config::{load_config, PaymentBackend, StreamerSettings};
use satstream::modules::api::{self, AppState};
use satstream::modules::gate::AccessGate;
use satstream::modules::keyring::KeyRotationManager;
use satstream::modules::payment::{MemoryProvider, PaymentProvider, ZbdProvider};
use satstream::modules::reconciler::{PaymentReconciler, ReconcilerSettings};
use satstream::modules::services::{start_order, ComponentSpec};
use satstream::modules::session::SessionRegistry;

const COMPONENTS: &[ComponentSpec] = &[
    ComponentSpec {
        name: "keyring",
        depends_on: &[],
    },
    ComponentSpec {
        name: "payment",
        depends_on: &[],
    },
    ComponentSpec {
        name: "session-registry",
        depends_on: &[],
    },
    ComponentSpec {
        name: "reconciler",
        depends_on: &["payment", "session-registry"],
    },
    ComponentSpec {
        name: "http",
        depends_on: &["session-registry", "keyring", "reconciler"],
    },
];

fn build_provider(
    settings: &StreamerSettings,
) -> Result<Arc<dyn PaymentProvider>, Box<dyn std::error::Error>> {
    match settings.payment_backend {
        PaymentBackend::Zbd => {
            let api_key = settings
                .zbd_api_key
                .clone()
                .ok_or("ZBD_API_KEY is required for the zbd backend")?;
            Ok(Arc::new(ZbdProvider::new(
                api_key,
                settings.zbd_api_base.clone(),
                settings.provider_timeout,
            )?))
        }
        PaymentBackend::Memory => {
            info!("Using in-memory payment provider (no wallet attached)");
            Ok(Arc::new(MemoryProvider::new()))
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    // any config failure aborts before a single session is accepted
    let settings = Arc::new(load_config()?);

    let order = start_order(COMPONENTS)?;
    info!("Component start order: {}", order.join(" -> "));

    let registry = SessionRegistry::new(settings.unhealthy_invoice_count);
    let keys = Arc::new(KeyRotationManager::new(
        settings.master_key,
        settings.key_info_path.clone(),
        settings.key_path.clone(),
    ));
    let provider = build_provider(&settings)?;

    let mut router = None;
    for name in order {
        match name {
            "keyring" => {
                // the segmenter needs key material before its first segment;
                // a failed initial handoff is a fatal startup error
                keys.rotate()?;
                keys.spawn_rotation(settings.rotation_interval);
            }
            "payment" | "session-registry" => {}
            "reconciler" => {
                let reconciler = Arc::new(PaymentReconciler::new(
                    registry.clone(),
                    Arc::clone(&provider),
                    ReconcilerSettings {
                        invoice_interval: settings.invoice_interval,
                        stale_timeout: settings.stale_timeout,
                        sats_per_invoice: settings.sats_per_invoice,
                    },
                ));
                reconciler.spawn(settings.reconcile_interval);
            }
            "http" => {
                let gate = Arc::new(AccessGate::new(
                    registry.clone(),
                    Arc::clone(&keys),
                    settings.public_base_url.clone(),
                ));
                router = Some(api::router(AppState {
                    registry: registry.clone(),
                    gate,
                    settings: Arc::clone(&settings),
                }));
            }
            other => unreachable!("unknown component {other}"),
        }
    }

    let router = router.ok_or("http component missing from start order")?;
    let listener = TcpListener::bind(("0.0.0.0", settings.port)).await?;
    info!("Listening on 0.0.0.0:{}", settings.port);
    axum::serve(listener, router).await?;
    Ok(())
}
