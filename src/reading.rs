use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Every metric the hub tracks. Power values are watts, lifetime energy is kWh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKey {
    PvPower,
    HomeLoadPower,
    /// Positive when importing from the utility, negative when exporting.
    GridNetPower,
    GridImportPower,
    GridExportPower,
    BatterySoc,
    PvLifetimeEnergy,
    HomeLoadLifetimeEnergy,
    GridNetLifetimeEnergy,
}

impl MetricKey {
    pub const ALL: [MetricKey; 9] = [
        MetricKey::PvPower,
        MetricKey::HomeLoadPower,
        MetricKey::GridNetPower,
        MetricKey::GridImportPower,
        MetricKey::GridExportPower,
        MetricKey::BatterySoc,
        MetricKey::PvLifetimeEnergy,
        MetricKey::HomeLoadLifetimeEnergy,
        MetricKey::GridNetLifetimeEnergy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKey::PvPower => "pv_power",
            MetricKey::HomeLoadPower => "home_load_power",
            MetricKey::GridNetPower => "grid_net_power",
            MetricKey::GridImportPower => "grid_import_power",
            MetricKey::GridExportPower => "grid_export_power",
            MetricKey::BatterySoc => "battery_soc",
            MetricKey::PvLifetimeEnergy => "pv_lifetime_energy",
            MetricKey::HomeLoadLifetimeEnergy => "home_load_lifetime_energy",
            MetricKey::GridNetLifetimeEnergy => "grid_net_lifetime_energy",
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            MetricKey::PvPower
            | MetricKey::HomeLoadPower
            | MetricKey::GridNetPower
            | MetricKey::GridImportPower
            | MetricKey::GridExportPower => "W",
            MetricKey::BatterySoc => "%",
            MetricKey::PvLifetimeEnergy
            | MetricKey::HomeLoadLifetimeEnergy
            | MetricKey::GridNetLifetimeEnergy => "kWh",
        }
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded frame. Lives only long enough to be folded into the live state and
/// the energy integrator.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub captured_at: DateTime<Utc>,
    values: BTreeMap<MetricKey, f64>,
}

impl Reading {
    pub fn new(captured_at: DateTime<Utc>) -> Self {
        Self {
            captured_at,
            values: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: MetricKey, value: f64) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: MetricKey, value: f64) {
        self.values.insert(key, value);
    }

    pub fn get(&self, key: MetricKey) -> Option<f64> {
        self.values.get(&key).copied()
    }

    pub fn contains(&self, key: MetricKey) -> bool {
        self.values.contains_key(&key)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (MetricKey, f64)> + '_ {
        self.values.iter().map(|(k, v)| (*k, *v))
    }
}
