use crate::error::HubError;
use crate::live_state::{LiveSnapshot, LiveStateStore};
use crate::reading::MetricKey;
use serde_derive::{Deserialize, Serialize};
use std::str::FromStr;

/// Which figure is surfaced as home consumption power.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumptionMode {
    /// The load figure reported by the gateway.
    #[default]
    Reported,
    /// PV production plus grid import minus grid export.
    Computed,
}

impl FromStr for ConsumptionMode {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reported" | "house_usage" => Ok(ConsumptionMode::Reported),
            "computed" => Ok(ConsumptionMode::Computed),
            other => Err(HubError::Config(format!(
                "unknown consumption measure '{other}', expected 'reported' or 'computed'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConsumptionResolver {
    mode: ConsumptionMode,
}

impl ConsumptionResolver {
    pub fn new(mode: ConsumptionMode) -> Self {
        Self { mode }
    }

    /// Home consumption in watts from whatever the store holds right now, or `None`
    /// when an input the mode needs has never been seen.
    pub fn resolve(&self, store: &LiveStateStore) -> Option<f64> {
        self.resolve_from(&store.snapshot())
    }

    pub fn resolve_from(&self, snapshot: &LiveSnapshot) -> Option<f64> {
        match self.mode {
            ConsumptionMode::Reported => snapshot.value(MetricKey::HomeLoadPower),
            ConsumptionMode::Computed => {
                let pv = snapshot.value(MetricKey::PvPower)?;
                let import = snapshot.value(MetricKey::GridImportPower)?;
                let export = snapshot.value(MetricKey::GridExportPower)?;
                Some(pv + import - export)
            }
        }
    }
}
