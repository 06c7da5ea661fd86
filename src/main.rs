use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing_subscriber::EnvFilter;

use aiops_engine::alert_state::AlertStore;
use aiops_engine::config::Settings;
use aiops_engine::engine::DetectionEngine;
use aiops_engine::history::HistoryCache;
use aiops_engine::prom::PrometheusClient;
use aiops_engine::receivers::AlertFanout;
use aiops_engine::store::MetricStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("aiops_engine=info")),
        )
        .init();

    let settings = Settings::from_env();

    let store = wait_for_store(&settings).await?;
    tracing::info!("durable store opened at {}", settings.database_path());

    let prom = Arc::new(PrometheusClient::new(
        &settings.prom_url,
        !settings.prom_skip_ssl,
    )?);
    wait_for_prometheus(&prom).await;

    let cache = Arc::new(HistoryCache::new(settings.analysis_window_hours));
    let fanout = Arc::new(AlertFanout::from_settings(&settings));
    let engine = DetectionEngine::new(
        settings,
        prom,
        store,
        cache,
        fanout,
        AlertStore::new("alerts_state.json"),
        PathBuf::from("status.json"),
    )?;

    tracing::info!("aiops-engine starting");
    tokio::select! {
        _ = engine.run() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received, exiting");
        }
    }

    Ok(())
}

/// The durable store is a strict dependency: block up to 60s for it, then
/// fail startup with a non-zero exit. The pool is sized for the worker fan-out
/// plus headroom for the orchestrator's own queries.
async fn wait_for_store(settings: &Settings) -> anyhow::Result<Arc<MetricStore>> {
    let deadline = Instant::now() + Duration::from_secs(60);
    let pool_size = settings.max_workers + 10;
    loop {
        match MetricStore::open(settings.database_path(), pool_size) {
            Ok(store) => {
                if store.ping().is_ok() {
                    return Ok(Arc::new(store));
                }
            }
            Err(e) => tracing::warn!("durable store not ready: {e}"),
        }
        if Instant::now() >= deadline {
            anyhow::bail!("durable store unavailable after 60s");
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}

/// The metric source is best-effort at startup: probe up to 30s, then carry
/// on regardless; per-cycle error handling takes over from there.
async fn wait_for_prometheus(prom: &PrometheusClient) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while Instant::now() < deadline {
        if prom.fetch_instant("up").await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
    tracing::warn!("prometheus not reachable yet, continuing anyway");
}
