use anyhow::Context;
use std::env;
use std::sync::Arc;
use sunpower_ws_hub::{HubConfig, JsonFileStore, LiveSnapshot, MetricKey, SeriesId, StreamingHub};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_STORE_PATH: &str = "energy_totals.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting SunPower PVS stream hub");
    let config = HubConfig::from_env()?;
    let store_path = env::var("PVS_ENERGY_STORE").unwrap_or_else(|_| DEFAULT_STORE_PATH.to_string());
    let store = JsonFileStore::open(&store_path)
        .with_context(|| format!("opening energy store {store_path}"))?;
    info!(store = %store.path().display(), "energy store opened");

    let hub = StreamingHub::new(config, Arc::new(store))?;
    info!(
        url = %hub.config().url(),
        throttle = hub.config().throttle_enabled,
        interval = ?hub.config().min_publish_interval,
        consumption = ?hub.config().consumption_mode,
        "configuration loaded"
    );
    hub.start();
    run_until_shutdown(&hub).await;
    hub.stop().await;

    for (series, total) in hub.energy_totals() {
        info!(%series, total_kwh = total.total_kwh, "final energy total");
    }
    Ok(())
}

/// Logs every publication until Ctrl-C.
async fn run_until_shutdown(hub: &StreamingHub) {
    let mut updates = hub.subscribe();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;
            result = &mut shutdown => {
                if let Err(e) = result {
                    warn!(error = %e, "failed to listen for shutdown signal");
                }
                info!("shutdown requested");
                return;
            }
            update = updates.recv() => match update {
                Ok(snapshot) => log_snapshot(hub, &snapshot),
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "log consumer lagged"),
                Err(RecvError::Closed) => return,
            },
        }
    }
}

fn log_snapshot(hub: &StreamingHub, snapshot: &LiveSnapshot) {
    if !snapshot.connected {
        warn!(last_error = ?snapshot.last_error, "PVS disconnected");
        return;
    }
    for (key, metric) in &snapshot.metrics {
        debug!(metric = %key, value = metric.value, unit = key.unit(), at = %metric.updated_at);
    }
    info!(
        pv_w = ?snapshot.value(MetricKey::PvPower),
        load_w = ?snapshot.value(MetricKey::HomeLoadPower),
        grid_w = ?snapshot.value(MetricKey::GridNetPower),
        soc = ?snapshot.value(MetricKey::BatterySoc),
        consumption_w = ?hub.home_consumption(),
        pv_kwh = ?hub.energy_total(SeriesId::PvLifetime).map(|t| t.total_kwh),
        "live update"
    );
}
