use crate::error::StoreError;
use crate::energy_integrator::SeriesId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// What survives a restart for one energy series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PersistedEnergy {
    pub total_kwh: f64,
    pub updated_at: DateTime<Utc>,
}

/// Durable key-value storage for energy totals, keyed by series.
pub trait EnergyStore: Send + Sync {
    fn load(&self, series: SeriesId) -> Result<Option<PersistedEnergy>, StoreError>;
    fn save(&self, series: SeriesId, record: &PersistedEnergy) -> Result<(), StoreError>;
}

/// Keeps totals in memory only. Useful for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<SeriesId, PersistedEnergy>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EnergyStore for MemoryStore {
    fn load(&self, series: SeriesId) -> Result<Option<PersistedEnergy>, StoreError> {
        Ok(self.records.lock().get(&series).copied())
    }

    fn save(&self, series: SeriesId, record: &PersistedEnergy) -> Result<(), StoreError> {
        self.records.lock().insert(series, *record);
        Ok(())
    }
}

/// Stores every series in one small JSON document:
///
/// ```json
/// { "pv_lifetime": { "total_kwh": 12.5, "updated_at": "2024-06-01T12:00:00Z" } }
/// ```
///
/// Writes go to a sibling temp file that is synced to disk and then renamed over the
/// original, so a crash mid-write leaves the previous document intact.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    records: Mutex<BTreeMap<String, PersistedEnergy>>,
}

impl JsonFileStore {
    /// Opens the store, reading the existing document if there is one. An existing but
    /// empty document is an error, never an empty store.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let records = match fs::read_to_string(&path) {
            Ok(raw) if raw.trim().is_empty() => return Err(StoreError::Empty(path)),
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_document(&self, records: &BTreeMap<String, PersistedEnergy>) -> Result<(), StoreError> {
        let body = serde_json::to_vec_pretty(records)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let mut file = File::create(&tmp)?;
        file.write_all(&body)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, &self.path)?;
        sync_parent_dir(&self.path)?;
        Ok(())
    }
}

/// Makes the rename itself durable.
#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> Result<(), StoreError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    File::open(parent)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

impl EnergyStore for JsonFileStore {
    fn load(&self, series: SeriesId) -> Result<Option<PersistedEnergy>, StoreError> {
        Ok(self.records.lock().get(series.as_str()).copied())
    }

    fn save(&self, series: SeriesId, record: &PersistedEnergy) -> Result<(), StoreError> {
        let mut records = self.records.lock();
        let previous = records.insert(series.as_str().to_string(), *record);
        if let Err(e) = self.write_document(&records) {
            // Keep the cache in step with the file
            match previous {
                Some(previous) => records.insert(series.as_str().to_string(), previous),
                None => records.remove(series.as_str()),
            };
            return Err(e);
        }
        Ok(())
    }
}
