use crate::reading::{MetricKey, Reading};
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde_derive::Serialize;
use std::collections::BTreeMap;

/// Latest known value of one metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricValue {
    pub value: f64,
    pub updated_at: DateTime<Utc>,
}

impl MetricValue {
    /// How long ago this value was last refreshed.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.updated_at
    }
}

/// A consistent copy of the whole store, as handed to readers and subscribers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LiveSnapshot {
    pub metrics: BTreeMap<MetricKey, MetricValue>,
    pub connected: bool,
    pub last_error: Option<String>,
}

impl LiveSnapshot {
    pub fn value(&self, key: MetricKey) -> Option<f64> {
        self.metrics.get(&key).map(|m| m.value)
    }
}

/// Latest-value cache owned by one hub.
///
/// Single writer (the receive loop), any number of readers. Writers build the
/// complete update before taking the lock, readers always get whole snapshots.
#[derive(Debug, Default)]
pub struct LiveStateStore {
    inner: RwLock<LiveSnapshot>,
}

impl LiveStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds a reading into the store. A per-metric timestamp never moves backwards:
    /// a reading captured before the stored one replaces the value but keeps the
    /// newer timestamp.
    pub fn apply(&self, reading: &Reading) {
        let mut state = self.inner.write();
        for (key, value) in reading.iter() {
            let updated_at = match state.metrics.get(&key) {
                Some(previous) if previous.updated_at > reading.captured_at => previous.updated_at,
                _ => reading.captured_at,
            };
            state.metrics.insert(key, MetricValue { value, updated_at });
        }
    }

    pub fn set_connected(&self, connected: bool, error: Option<String>) {
        let mut state = self.inner.write();
        state.connected = connected;
        if error.is_some() {
            state.last_error = error;
        }
    }

    pub fn get(&self, key: MetricKey) -> Option<MetricValue> {
        self.inner.read().metrics.get(&key).copied()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.read().connected
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.read().last_error.clone()
    }

    pub fn snapshot(&self) -> LiveSnapshot {
        self.inner.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_apply_and_read() {
        let store = LiveStateStore::new();
        store.apply(&Reading::new(t0()).with(MetricKey::PvPower, 1200.0));

        let pv = store.get(MetricKey::PvPower).unwrap();
        assert_eq!(pv.value, 1200.0);
        assert_eq!(pv.updated_at, t0());
        assert_eq!(pv.age(t0() + Duration::seconds(90)), Duration::seconds(90));
        assert!(store.get(MetricKey::HomeLoadPower).is_none());
    }

    #[test]
    fn test_timestamps_never_decrease() {
        let store = LiveStateStore::new();
        store.apply(&Reading::new(t0()).with(MetricKey::PvPower, 1.0));
        store.apply(&Reading::new(t0() - Duration::seconds(5)).with(MetricKey::PvPower, 2.0));

        let pv = store.get(MetricKey::PvPower).unwrap();
        assert_eq!(pv.value, 2.0);
        assert_eq!(pv.updated_at, t0());

        let mut last = pv.updated_at;
        for i in 1..20 {
            let offset = if i % 3 == 0 { -i } else { i };
            store.apply(
                &Reading::new(t0() + Duration::seconds(offset)).with(MetricKey::PvPower, i as f64),
            );
            let now = store.get(MetricKey::PvPower).unwrap().updated_at;
            assert!(now >= last);
            last = now;
        }
    }

    #[test]
    fn test_stale_entries_are_kept() {
        let store = LiveStateStore::new();
        store.apply(&Reading::new(t0()).with(MetricKey::BatterySoc, 0.5));
        store.apply(&Reading::new(t0() + Duration::hours(2)).with(MetricKey::PvPower, 10.0));

        let soc = store.get(MetricKey::BatterySoc).unwrap();
        assert_eq!(soc.updated_at, t0());
        assert_eq!(store.snapshot().metrics.len(), 2);
    }

    #[test]
    fn test_connectivity_and_last_error() {
        let store = LiveStateStore::new();
        assert!(!store.is_connected());

        store.set_connected(true, None);
        assert!(store.is_connected());

        store.set_connected(false, Some("connection reset".to_string()));
        assert!(!store.is_connected());
        assert_eq!(store.last_error().as_deref(), Some("connection reset"));

        // A later reconnect keeps the last error for diagnosis
        store.set_connected(true, None);
        assert_eq!(store.last_error().as_deref(), Some("connection reset"));
    }

    #[test]
    fn test_instances_are_independent() {
        let a = LiveStateStore::new();
        let b = LiveStateStore::new();
        a.apply(&Reading::new(t0()).with(MetricKey::PvPower, 1.0));
        a.set_connected(true, None);
        assert!(b.get(MetricKey::PvPower).is_none());
        assert!(!b.is_connected());
    }
}
