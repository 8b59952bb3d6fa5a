use crate::consumption::ConsumptionMode;
use crate::energy_integrator::IntegratorConfig;
use crate::error::HubError;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tokio_tungstenite::tungstenite::http::Uri;

pub const DEFAULT_HOST: &str = "172.27.153.1";
pub const DEFAULT_PORT: u16 = 9002;

/// Everything needed to build a hub. Changing any of it means stopping the hub and
/// building a new one.
#[derive(Debug, Clone, PartialEq)]
pub struct HubConfig {
    pub host: String,
    pub port: u16,
    pub throttle_enabled: bool,
    /// Minimum spacing between live-state publications. Zero disables throttling.
    pub min_publish_interval: Duration,
    pub consumption_mode: ConsumptionMode,
    /// Intervals between power samples longer than this are not integrated.
    pub max_integration_gap: Duration,
    /// Minimum spacing between durable writes of an energy total.
    pub persist_interval: Duration,
    pub connect_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub heartbeat_interval: Duration,
    /// The connection is considered dead when no frame arrives for this long.
    pub idle_timeout: Duration,
    /// Upper bound on how long `stop` waits for the connection loop.
    pub shutdown_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            throttle_enabled: true,
            min_publish_interval: Duration::from_secs(1),
            consumption_mode: ConsumptionMode::Reported,
            max_integration_gap: Duration::from_secs(3600),
            persist_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl HubConfig {
    /// Reads the configuration from `PVS_*` environment variables, falling back to
    /// the defaults for anything unset.
    pub fn from_env() -> Result<Self, HubError> {
        let defaults = Self::default();
        let config = Self {
            host: env::var("PVS_HOST").unwrap_or(defaults.host),
            port: parse_env("PVS_PORT")?.unwrap_or(defaults.port),
            throttle_enabled: parse_bool_or(env::var("PVS_THROTTLE").ok(), defaults.throttle_enabled),
            min_publish_interval: parse_env("PVS_UPDATE_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.min_publish_interval),
            consumption_mode: parse_env("PVS_CONSUMPTION_MEASURE")?
                .unwrap_or(defaults.consumption_mode),
            max_integration_gap: parse_env("PVS_MAX_GAP_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.max_integration_gap),
            persist_interval: parse_env("PVS_PERSIST_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.persist_interval),
            ..defaults
        };
        config.validate()?;
        Ok(config)
    }

    /// The WebSocket endpoint of the gateway. IPv6 literals are bracketed.
    pub fn url(&self) -> String {
        let host = self.host.trim();
        if host.contains(':') && !host.starts_with('[') {
            format!("ws://[{}]:{}/", host, self.port)
        } else {
            format!("ws://{}:{}/", host, self.port)
        }
    }

    /// Rejects configurations that can never connect. These are not retried.
    pub fn validate(&self) -> Result<(), HubError> {
        let host = self.host.trim();
        if host.is_empty() || host.chars().any(|c| c.is_whitespace() || c == '/') {
            return Err(HubError::Config(format!("invalid host '{}'", self.host)));
        }
        if self.port == 0 {
            return Err(HubError::Config("port must be non-zero".to_string()));
        }
        let uri: Uri = self
            .url()
            .parse()
            .map_err(|e| HubError::Config(format!("invalid address {}: {e}", self.url())))?;
        if uri.host().map_or(true, str::is_empty) {
            return Err(HubError::Config(format!("invalid address {}", self.url())));
        }
        if self.max_backoff < self.initial_backoff || self.initial_backoff.is_zero() {
            return Err(HubError::Config(
                "backoff must satisfy 0 < initial_backoff <= max_backoff".to_string(),
            ));
        }
        if self.heartbeat_interval.is_zero()
            || self.idle_timeout.is_zero()
            || self.connect_timeout.is_zero()
        {
            return Err(HubError::Config(
                "connect_timeout, heartbeat_interval and idle_timeout must be non-zero".to_string(),
            ));
        }
        if self.max_integration_gap.is_zero() {
            return Err(HubError::Config("max_integration_gap must be non-zero".to_string()));
        }
        Ok(())
    }

    pub fn integrator(&self) -> IntegratorConfig {
        IntegratorConfig {
            max_gap: self.max_integration_gap,
            persist_interval: self.persist_interval,
        }
    }
}

fn parse_env<T>(name: &str) -> Result<Option<T>, HubError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| HubError::Config(format!("{name}='{raw}': {e}"))),
        Err(_) => Ok(None),
    }
}

/// Parses a boolean case-insensitively, using `default` when unset or unparsable.
fn parse_bool_or(val: Option<String>, default: bool) -> bool {
    val.map(|v| v.trim().to_ascii_lowercase())
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
