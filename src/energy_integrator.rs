//! Converts instantaneous power samples into cumulative energy counters.
//!
//! Each series integrates with the trapezoidal rule: the energy added between two
//! consecutive samples is the mean of their power times the elapsed time. The first
//! sample after start, after a disconnect, or after an implausible gap only sets a
//! baseline. Totals never decrease except through an explicit [`EnergyIntegrator::reset`].

use crate::reading::{MetricKey, Reading};
use crate::store::{EnergyStore, PersistedEnergy};
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

const SECONDS_PER_HOUR: f64 = 3600.0;
const WATTS_PER_KILOWATT: f64 = 1000.0;

/// One independently tracked cumulative energy counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeriesId {
    PvLifetime,
    HomeLoadLifetime,
    GridImport,
    GridExport,
}

impl SeriesId {
    pub const ALL: [SeriesId; 4] = [
        SeriesId::PvLifetime,
        SeriesId::HomeLoadLifetime,
        SeriesId::GridImport,
        SeriesId::GridExport,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SeriesId::PvLifetime => "pv_lifetime",
            SeriesId::HomeLoadLifetime => "home_load_lifetime",
            SeriesId::GridImport => "grid_import",
            SeriesId::GridExport => "grid_export",
        }
    }

    /// The power metric integrated into this series.
    pub fn power_source(&self) -> MetricKey {
        match self {
            SeriesId::PvLifetime => MetricKey::PvPower,
            SeriesId::HomeLoadLifetime => MetricKey::HomeLoadPower,
            SeriesId::GridImport => MetricKey::GridImportPower,
            SeriesId::GridExport => MetricKey::GridExportPower,
        }
    }

    /// Device-reported lifetime counter shown next to this series, if the gateway has one.
    pub fn reference_source(&self) -> Option<MetricKey> {
        match self {
            SeriesId::PvLifetime => Some(MetricKey::PvLifetimeEnergy),
            SeriesId::HomeLoadLifetime => Some(MetricKey::HomeLoadLifetimeEnergy),
            SeriesId::GridImport | SeriesId::GridExport => None,
        }
    }
}

impl fmt::Display for SeriesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IntegratorConfig {
    /// Intervals longer than this are not integrated across.
    pub max_gap: std::time::Duration,
    /// Minimum spacing between durable writes of one series. Zero writes every step.
    pub persist_interval: std::time::Duration,
}

impl Default for IntegratorConfig {
    fn default() -> Self {
        Self {
            max_gap: std::time::Duration::from_secs(3600),
            persist_interval: std::time::Duration::ZERO,
        }
    }
}

/// Reader-facing view of one series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EnergyTotal {
    pub total_kwh: f64,
    pub last_sample_at: Option<DateTime<Utc>>,
    pub last_power_w: Option<f64>,
    /// Lifetime value reported by the device, for display only.
    pub reference_kwh: Option<f64>,
}

#[derive(Debug, Clone, Default)]
struct Accumulator {
    total_kwh: f64,
    last_sample_at: Option<DateTime<Utc>>,
    last_power_w: Option<f64>,
    reference_kwh: Option<f64>,
    /// The persisted total has been folded in. Until then `total_kwh` only holds
    /// what was integrated since start, and nothing is written back.
    restored: bool,
    load_failures: u32,
    dirty: bool,
    last_persisted_at: Option<DateTime<Utc>>,
}

impl Accumulator {
    fn view(&self) -> EnergyTotal {
        EnergyTotal {
            total_kwh: self.total_kwh,
            last_sample_at: self.last_sample_at,
            last_power_w: self.last_power_w,
            reference_kwh: self.reference_kwh,
        }
    }

    fn record(&self, at: DateTime<Utc>) -> PersistedEnergy {
        PersistedEnergy {
            total_kwh: self.total_kwh,
            updated_at: self.last_sample_at.unwrap_or(at),
        }
    }

    fn rebase(&mut self, watts: f64, at: DateTime<Utc>) {
        self.last_sample_at = Some(at);
        self.last_power_w = Some(watts);
    }

    /// The single place a total changes during integration.
    fn commit(&mut self, series: SeriesId, candidate_kwh: f64) -> bool {
        if candidate_kwh.is_nan() || candidate_kwh < self.total_kwh {
            warn!(
                %series,
                current_kwh = self.total_kwh,
                candidate_kwh,
                "anomaly: rejected energy total regression"
            );
            return false;
        }
        self.total_kwh = candidate_kwh;
        self.dirty = true;
        true
    }
}

pub struct EnergyIntegrator {
    config: IntegratorConfig,
    store: Arc<dyn EnergyStore>,
    series: RwLock<BTreeMap<SeriesId, Accumulator>>,
    /// Serializes reading a record and saving it, so the last write always carries
    /// the latest in-memory total.
    persist_lock: Mutex<()>,
}

impl EnergyIntegrator {
    pub fn new(config: IntegratorConfig, store: Arc<dyn EnergyStore>) -> Self {
        Self {
            config,
            store,
            series: RwLock::new(BTreeMap::new()),
            persist_lock: Mutex::new(()),
        }
    }

    /// Loads the persisted totals of every series. Safe to call again on restart.
    pub fn restore(&self) {
        for series in SeriesId::ALL {
            self.restore_series(series);
        }
    }

    fn restore_series(&self, series: SeriesId) {
        let loaded = self.store.load(series);

        let mut all = self.series.write();
        let acc = all.entry(series).or_default();
        let record = match loaded {
            Ok(record) => record,
            Err(e) => {
                // A read error is not an absent record: stay unrestored so the durable
                // total is never overwritten, and retry on the next sample
                acc.load_failures += 1;
                if acc.load_failures == 1 {
                    warn!(%series, error = %e, "failed to load persisted energy total; holding writes until it loads");
                } else {
                    debug!(%series, attempts = acc.load_failures, error = %e, "energy total still unreadable");
                }
                return;
            }
        };

        match record {
            Some(record) if record.total_kwh.is_finite() && record.total_kwh >= 0.0 => {
                if !acc.restored {
                    // Energy integrated while the store was unreadable sits on top
                    let pending_kwh = acc.total_kwh;
                    acc.total_kwh = record.total_kwh + pending_kwh;
                    acc.last_persisted_at = Some(record.updated_at);
                    acc.dirty = pending_kwh > 0.0;
                    info!(%series, total_kwh = record.total_kwh, pending_kwh, "restored energy total");
                } else if record.total_kwh < acc.total_kwh {
                    warn!(
                        %series,
                        persisted_kwh = record.total_kwh,
                        current_kwh = acc.total_kwh,
                        "anomaly: persisted total is below the running total; keeping running total"
                    );
                    acc.dirty = true;
                } else {
                    acc.total_kwh = record.total_kwh;
                    acc.last_persisted_at = Some(record.updated_at);
                    info!(%series, total_kwh = record.total_kwh, "restored energy total");
                }
            }
            Some(record) => {
                warn!(%series, persisted_kwh = record.total_kwh, "ignoring invalid persisted energy total");
            }
            None => debug!(%series, "no persisted energy total"),
        }
        acc.restored = true;
        acc.load_failures = 0;
        // Time since the last run is never integrated
        acc.last_sample_at = None;
        acc.last_power_w = None;
    }

    /// Feeds one power sample to a series and returns the updated total in kWh.
    pub fn integrate(&self, series: SeriesId, watts: f64, at: DateTime<Utc>) -> f64 {
        if !self.is_restored(series) {
            self.restore_series(series);
        }

        let watts = if watts.is_finite() { watts.max(0.0) } else { 0.0 };
        let (total, due) = {
            let mut all = self.series.write();
            let acc = all.entry(series).or_default();
            self.step(series, acc, watts, at);
            let due = acc.restored && acc.dirty && self.persist_due(acc, at);
            (acc.total_kwh, due)
        };

        if due {
            self.persist(series, at);
        }
        total
    }

    fn step(&self, series: SeriesId, acc: &mut Accumulator, watts: f64, at: DateTime<Utc>) {
        let (Some(prev_at), Some(prev_w)) = (acc.last_sample_at, acc.last_power_w) else {
            debug!(%series, watts, "baseline sample");
            acc.rebase(watts, at);
            return;
        };

        let elapsed = at - prev_at;
        if elapsed <= Duration::zero() {
            warn!(%series, %prev_at, %at, "anomaly: non-increasing sample time; discarding interval");
            acc.rebase(watts, at);
            return;
        }
        if elapsed > self.max_gap() {
            warn!(
                %series,
                gap_secs = elapsed.num_seconds(),
                "anomaly: gap exceeds integration ceiling; discarding interval"
            );
            acc.rebase(watts, at);
            return;
        }

        let hours = elapsed.num_milliseconds() as f64 / 1000.0 / SECONDS_PER_HOUR;
        let added_kwh = (prev_w + watts) / 2.0 * hours / WATTS_PER_KILOWATT;
        if added_kwh > 0.0 {
            acc.commit(series, acc.total_kwh + added_kwh);
        }
        acc.rebase(watts, at);
    }

    /// Feeds every series whose source metric is present in the reading and records
    /// the device's lifetime counters as references.
    pub fn observe(&self, reading: &Reading) {
        for series in SeriesId::ALL {
            if let Some(watts) = reading.get(series.power_source()) {
                self.integrate(series, watts, reading.captured_at);
            }
            if let Some(kwh) = series.reference_source().and_then(|key| reading.get(key)) {
                self.observe_reference(series, kwh);
            }
        }
    }

    /// Records an externally reported lifetime value. It is shown alongside the total
    /// but never replaces it.
    pub fn observe_reference(&self, series: SeriesId, kwh: f64) {
        let mut all = self.series.write();
        let acc = all.entry(series).or_default();
        if acc.restored && kwh < acc.total_kwh {
            debug!(
                %series,
                reference_kwh = kwh,
                total_kwh = acc.total_kwh,
                "device reference below running total"
            );
        }
        acc.reference_kwh = Some(kwh);
    }

    /// Drops every baseline so the next sample of each series starts fresh. Called
    /// when the stream is interrupted; the outage is not integrated.
    pub fn break_baselines(&self) {
        for acc in self.series.write().values_mut() {
            acc.last_sample_at = None;
            acc.last_power_w = None;
        }
    }

    /// Explicitly sets a series back to zero and persists it.
    pub fn reset(&self, series: SeriesId) {
        {
            let mut all = self.series.write();
            let acc = all.entry(series).or_default();
            info!(%series, previous_kwh = acc.total_kwh, "resetting energy total");
            acc.total_kwh = 0.0;
            acc.last_sample_at = None;
            acc.last_power_w = None;
            acc.restored = true;
            acc.load_failures = 0;
            acc.dirty = true;
        }
        self.persist(series, Utc::now());
    }

    /// Writes every series with unsaved changes.
    pub fn flush(&self) {
        let now = Utc::now();
        let pending: Vec<SeriesId> = self
            .series
            .read()
            .iter()
            .filter(|(_, acc)| acc.restored && acc.dirty)
            .map(|(series, _)| *series)
            .collect();
        for series in pending {
            self.persist(series, now);
        }
    }

    pub fn total(&self, series: SeriesId) -> Option<EnergyTotal> {
        self.series
            .read()
            .get(&series)
            .filter(|acc| acc.restored)
            .map(Accumulator::view)
    }

    pub fn totals(&self) -> BTreeMap<SeriesId, EnergyTotal> {
        self.series
            .read()
            .iter()
            .filter(|(_, acc)| acc.restored)
            .map(|(series, acc)| (*series, acc.view()))
            .collect()
    }

    fn is_restored(&self, series: SeriesId) -> bool {
        self.series
            .read()
            .get(&series)
            .map(|acc| acc.restored)
            .unwrap_or(false)
    }

    fn max_gap(&self) -> Duration {
        Duration::from_std(self.config.max_gap).unwrap_or(Duration::MAX)
    }

    fn persist_due(&self, acc: &Accumulator, at: DateTime<Utc>) -> bool {
        if self.config.persist_interval.is_zero() {
            return true;
        }
        let interval = Duration::from_std(self.config.persist_interval).unwrap_or(Duration::MAX);
        match acc.last_persisted_at {
            None => true,
            Some(last) => at < last || at - last >= interval,
        }
    }

    /// Saves the current state of a restored series.
    fn persist(&self, series: SeriesId, at: DateTime<Utc>) {
        let _guard = self.persist_lock.lock();
        let record = match self.series.read().get(&series) {
            Some(acc) if acc.restored => acc.record(at),
            _ => return,
        };

        match self.store.save(series, &record) {
            Ok(()) => {
                let mut all = self.series.write();
                if let Some(acc) = all.get_mut(&series) {
                    // A newer increment may have landed in between; it stays dirty
                    if acc.total_kwh == record.total_kwh {
                        acc.dirty = false;
                    }
                    acc.last_persisted_at = Some(record.updated_at);
                }
            }
            Err(e) => {
                warn!(%series, error = %e, "failed to persist energy total; will retry");
            }
        }
    }
}
