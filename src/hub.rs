use crate::config::HubConfig;
use crate::consumption::ConsumptionResolver;
use crate::energy_integrator::{EnergyIntegrator, EnergyTotal, SeriesId};
use crate::error::{DecodeError, HubError};
use crate::frame_decoder;
use crate::live_state::{LiveSnapshot, LiveStateStore, MetricValue};
use crate::reading::{MetricKey, Reading};
use crate::store::EnergyStore;
use crate::throttle::ThrottleGate;
use crate::transport::{ConnectionState, FrameHandler, TransportConnector};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const SUBSCRIBER_CAPACITY: usize = 16;
const LOGGED_PAYLOAD_CHARS: usize = 120;

/// Everything the receive loop writes to. Shared between the hub and the transport task.
struct Pipeline {
    live: LiveStateStore,
    integrator: EnergyIntegrator,
    throttle: Mutex<ThrottleGate>,
    updates: broadcast::Sender<LiveSnapshot>,
}

impl Pipeline {
    fn ingest(&self, reading: &Reading) {
        // Every sample is integrated; only publication is throttled
        self.integrator.observe(reading);

        if !self.throttle.lock().should_publish(reading.captured_at) {
            return;
        }
        self.live.apply(reading);
        self.publish();
    }

    fn publish(&self) {
        // No receivers is not an error
        let _ = self.updates.send(self.live.snapshot());
    }
}

impl FrameHandler for Pipeline {
    fn on_frame(&self, payload: &str) {
        match frame_decoder::decode(payload) {
            Ok(reading) => self.ingest(&reading),
            Err(DecodeError::NoKnownFields) => debug!("frame carries no known metrics"),
            Err(e) => warn!(
                error = %e,
                payload = %payload.chars().take(LOGGED_PAYLOAD_CHARS).collect::<String>(),
                "dropping undecodable frame"
            ),
        }
    }

    fn on_connection_change(&self, connected: bool, error: Option<&str>) {
        if !connected {
            self.integrator.break_baselines();
        }
        if self.live.is_connected() == connected && error.is_none() {
            return;
        }
        self.live.set_connected(connected, error.map(str::to_string));
        self.publish();
    }
}

/// One gateway connection with its own live state and energy totals.
///
/// Several hubs may run side by side; nothing is shared between them.
pub struct StreamingHub {
    config: HubConfig,
    resolver: ConsumptionResolver,
    pipeline: Arc<Pipeline>,
    transport: TransportConnector,
}

impl StreamingHub {
    pub fn new(config: HubConfig, store: Arc<dyn EnergyStore>) -> Result<Self, HubError> {
        let transport = TransportConnector::new(&config)?;
        let (updates, _) = broadcast::channel(SUBSCRIBER_CAPACITY);
        let pipeline = Arc::new(Pipeline {
            live: LiveStateStore::new(),
            integrator: EnergyIntegrator::new(config.integrator(), store),
            throttle: Mutex::new(ThrottleGate::new(
                config.throttle_enabled,
                config.min_publish_interval,
            )),
            updates,
        });

        Ok(Self {
            resolver: ConsumptionResolver::new(config.consumption_mode),
            config,
            pipeline,
            transport,
        })
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Restores energy totals and starts streaming. Must be called inside a tokio runtime.
    pub fn start(&self) {
        self.pipeline.integrator.restore();
        self.pipeline.throttle.lock().reset();
        if self.transport.start(self.pipeline.clone()) {
            info!(url = %self.transport.url(), "hub started");
        }
    }

    /// Stops intake first, then persists energy totals. Safe to call more than once.
    pub async fn stop(&self) {
        self.transport.stop().await;
        self.pipeline.integrator.flush();
        info!(url = %self.transport.url(), "hub stopped");
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub fn last_error(&self) -> Option<String> {
        self.pipeline.live.last_error()
    }

    pub fn metric(&self, key: MetricKey) -> Option<MetricValue> {
        self.pipeline.live.get(key)
    }

    pub fn live_snapshot(&self) -> LiveSnapshot {
        self.pipeline.live.snapshot()
    }

    pub fn energy_total(&self, series: SeriesId) -> Option<EnergyTotal> {
        self.pipeline.integrator.total(series)
    }

    pub fn energy_totals(&self) -> BTreeMap<SeriesId, EnergyTotal> {
        self.pipeline.integrator.totals()
    }

    /// Home consumption in watts, `None` while an input is unavailable.
    pub fn home_consumption(&self) -> Option<f64> {
        self.resolver.resolve(&self.pipeline.live)
    }

    /// Receives a snapshot on every publication and connectivity change.
    pub fn subscribe(&self) -> broadcast::Receiver<LiveSnapshot> {
        self.pipeline.updates.subscribe()
    }

    pub fn reset_energy(&self, series: SeriesId) {
        self.pipeline.integrator.reset(series);
    }

    #[cfg(test)]
    fn ingest(&self, payload: &str) {
        self.pipeline.on_frame(payload);
    }
}
