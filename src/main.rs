use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{get, put};
use tokio::sync::{Notify, watch};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use trixel_tms::config::Config;
use trixel_tms::manager::{PrivacyManager, TmsStatus};
use trixel_tms::store::Store;
use trixel_tms::tls::TlsClient;
use trixel_tms::{AppState, handlers};

const MAX_TLS_SYNC_ATTEMPTS: u32 = 10;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("trixel_tms=debug,tower_http=debug")
        }))
        .init();

    let config_path = std::env::var("TMS_CONFIG").unwrap_or_else(|_| "./tms.toml".to_string());
    let mut config = Config::load(&config_path)?;
    if let Ok(token) = std::env::var("TMS_API_TOKEN") {
        config.tls.api_token = Some(token);
    }
    let config = Arc::new(config);
    tracing::info!(
        "privatizer policy: {}, tick period: {}s",
        config.privatizer.name(),
        config.trixel_update_frequency_secs
    );

    let store = Arc::new(Store::open(&config.store.path)?);
    tracing::info!("store opened at {}", config.store.path);

    let tls = Arc::new(TlsClient::new(&config.tls)?);

    let (status_tx, status_rx) = watch::channel(TmsStatus::default());
    let manager = Arc::new(PrivacyManager::new(
        config.clone(),
        store.clone(),
        tls.clone(),
        status_rx,
    ));
    let shutdown = manager.shutdown_signal();

    tokio::spawn(synchronize_with_tls(tls, status_tx, shutdown.clone()));
    tokio::spawn(manager.clone().periodic_processing());
    tokio::spawn(purge_old_data(store.clone(), config.clone()));

    let state = AppState { store, manager };
    let app = Router::new()
        .route(
            "/api/v1/measurements/{ms_uuid}",
            put(handlers::measurements::batch_update),
        )
        .route("/healthz", get(handlers::health::healthz))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], 8080));
    tracing::info!("trixel-tms listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown.notified() => {
                    tracing::error!("shutting down after critical TLS failure");
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutting down");
                }
            }
        })
        .await?;

    Ok(())
}

/// Fetch the delegations assigned to this TMS and mark it active. Transient
/// failures are retried a bounded number of times; critical failures stop the
/// service.
async fn synchronize_with_tls(
    tls: Arc<TlsClient>,
    status_tx: watch::Sender<TmsStatus>,
    shutdown: Arc<Notify>,
) {
    let mut attempts = 0;
    loop {
        match tls.fetch_delegations().await {
            Ok(delegations) => {
                if delegations.is_empty() {
                    tracing::warn!("TLS reports no delegations for this TMS; staying idle");
                } else {
                    tracing::info!("synchronized with TLS, delegations: {delegations:?}");
                }
                let _ = status_tx.send(TmsStatus { active: true, delegations });
                return;
            }
            Err(e) if e.is_critical() => {
                tracing::error!("critical TLS failure during startup: {e}");
                shutdown.notify_waiters();
                return;
            }
            Err(e) => {
                attempts += 1;
                if attempts >= MAX_TLS_SYNC_ATTEMPTS {
                    tracing::error!("TLS unreachable after {attempts} attempts: {e}");
                    shutdown.notify_waiters();
                    return;
                }
                tracing::warn!("TLS sync attempt {attempts} failed: {e}, retrying");
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    }
}

/// Periodically drop raw measurements beyond the configured keep interval.
async fn purge_old_data(store: Arc<Store>, config: Arc<Config>) {
    let mut interval =
        tokio::time::interval(Duration::from_secs(config.sensor_data_purge_interval_secs));
    loop {
        interval.tick().await;
        let cutoff = chrono::Utc::now() - config.sensor_data_keep_interval();
        match store.purge_old_sensor_data(cutoff) {
            Ok(0) => {}
            Ok(count) => tracing::info!("purged {count} sensor measurement(s)"),
            Err(e) => tracing::warn!("purging old sensor data failed: {e}"),
        }
    }
}
