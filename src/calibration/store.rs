//! Calibration store: named float values, persisted as a two-column CSV.
//!
//! A missing or never-written name reads back as `UNCALIBRATED`.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs::File,
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::error::{ControlError, ControlResult};

/// Sentinel returned for values that were never calibrated.
pub const UNCALIBRATED: f64 = -1.0;

pub const DIAMETER_COEFFICIENT: &str = "diameter_coefficient";
pub const MOTOR_SLOPE: &str = "motor_slope";
pub const MOTOR_INTERCEPT: &str = "motor_intercept";

#[inline]
pub fn is_uncalibrated(value: f64) -> bool {
    value == UNCALIBRATED || !value.is_finite()
}

pub trait CalibrationStore: Send + Sync {
    fn get(&self, name: &str) -> f64;
    fn set(&self, name: &str, value: f64) -> ControlResult<()>;
}

pub type SharedStore = Arc<dyn CalibrationStore>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    pub name: String,
    pub value: f64,
}

/// Volatile store, used by tests and by runs without a calibration file.
#[derive(Default)]
pub struct MemoryStore {
    values: RwLock<HashMap<String, f64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_values(values: &[(&str, f64)]) -> Self {
        let store = Self::new();
        {
            let mut map = store.values.write();
            for (name, value) in values {
                map.insert((*name).to_string(), *value);
            }
        }
        store
    }
}

impl CalibrationStore for MemoryStore {
    fn get(&self, name: &str) -> f64 {
        self.values.read().get(name).copied().unwrap_or(UNCALIBRATED)
    }

    fn set(&self, name: &str, value: f64) -> ControlResult<()> {
        self.values.write().insert(name.to_string(), value);
        Ok(())
    }
}

/// File-backed store. The whole file is rewritten on every `set`.
pub struct CsvStore {
    path: PathBuf,
    values: RwLock<HashMap<String, f64>>,
}

impl CsvStore {
    /// Load `path` if it exists; a missing file starts an empty store.
    pub fn open(path: impl AsRef<Path>) -> ControlResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut values = HashMap::new();

        if path.exists() {
            let mut reader = csv::Reader::from_path(&path)?;
            for row in reader.deserialize() {
                let record: CalibrationRecord = row?;
                values.insert(record.name, record.value);
            }
            log::info!("[Calibration] loaded {} value(s) from {}", values.len(), path.display());
        } else {
            log::warn!("[Calibration] {} not found, starting uncalibrated", path.display());
        }

        Ok(Self {
            path,
            values: RwLock::new(values),
        })
    }

    fn persist(&self, values: &HashMap<String, f64>) -> ControlResult<()> {
        let file = File::create(&self.path)
            .map_err(|e| ControlError::Store(format!("{}: {}", self.path.display(), e)))?;
        let mut writer = csv::Writer::from_writer(file);

        let mut names: Vec<&String> = values.keys().collect();
        names.sort();
        for name in names {
            writer.serialize(CalibrationRecord {
                name: name.clone(),
                value: values[name],
            })?;
        }
        writer
            .flush()
            .map_err(|e| ControlError::Store(e.to_string()))?;
        Ok(())
    }
}

impl CalibrationStore for CsvStore {
    fn get(&self, name: &str) -> f64 {
        self.values.read().get(name).copied().unwrap_or(UNCALIBRATED)
    }

    fn set(&self, name: &str, value: f64) -> ControlResult<()> {
        let mut values = self.values.write();
        values.insert(name.to_string(), value);
        self.persist(&values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_names_read_as_sentinel() {
        let store = MemoryStore::new();
        assert_eq!(store.get(MOTOR_SLOPE), UNCALIBRATED);
        assert!(is_uncalibrated(store.get(DIAMETER_COEFFICIENT)));
        store.set(MOTOR_SLOPE, 0.66).unwrap();
        assert_eq!(store.get(MOTOR_SLOPE), 0.66);
    }

    #[test]
    fn csv_store_survives_reopen() {
        let dir = std::env::temp_dir().join(format!("fiberline-store-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("calibration.csv");
        let _ = std::fs::remove_file(&path);

        {
            let store = CsvStore::open(&path).unwrap();
            assert_eq!(store.get(DIAMETER_COEFFICIENT), UNCALIBRATED);
            store.set(DIAMETER_COEFFICIENT, 0.0078125).unwrap();
            store.set(MOTOR_SLOPE, 0.5).unwrap();
        }

        let reopened = CsvStore::open(&path).unwrap();
        assert_eq!(reopened.get(DIAMETER_COEFFICIENT), 0.0078125);
        assert_eq!(reopened.get(MOTOR_SLOPE), 0.5);
        assert_eq!(reopened.get(MOTOR_INTERCEPT), UNCALIBRATED);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
