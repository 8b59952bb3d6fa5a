//! SunPower PVS Streaming Hub Library
//!
//! Keeps a WebSocket session to a SunPower PVS gateway alive, decodes its telemetry
//! frames, and exposes throttled live readings, integrated energy totals, and home
//! consumption to any number of readers.

pub mod config;
pub mod consumption;
pub mod energy_integrator;
pub mod error;
pub mod frame_decoder;
pub mod hub;
pub mod live_state;
pub mod reading;
pub mod store;
pub mod throttle;
pub mod transport;

// Re-export commonly used types for easier access
pub use config::HubConfig;
pub use consumption::{ConsumptionMode, ConsumptionResolver};
pub use energy_integrator::{EnergyIntegrator, EnergyTotal, IntegratorConfig, SeriesId};
pub use error::{DecodeError, HubError, StoreError};
pub use hub::StreamingHub;
pub use live_state::{LiveSnapshot, LiveStateStore, MetricValue};
pub use reading::{MetricKey, Reading};
pub use store::{EnergyStore, JsonFileStore, MemoryStore, PersistedEnergy};
pub use throttle::ThrottleGate;
pub use transport::{ConnectionEvent, ConnectionState, FrameHandler, TransportConnector};
