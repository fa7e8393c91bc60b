// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright © 2024 Adrian <adrian.eddy at gmail>

use std::collections::BTreeMap;
use std::path::Path;
use parking_lot::RwLock;
use serde::Deserialize;

use crate::calibration::{ BBOX_SLOTS, CalibrationError, CalibrationVector };

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0:?}")]                        Io(#[from] std::io::Error),
    #[error("Invalid calibration file: {0}")]          Parse(#[from] serde_json::Error),
    #[error("Invalid calibration for {make} {model}: {source}")] Invalid { make: String, model: String, source: CalibrationError },
}

/// Known cameras and their calibration vectors. Read-only from the LUT side.
pub trait CalibrationStore: Send + Sync {
    fn get(&self, make: &str, model: &str) -> Option<CalibrationVector>;
    fn list_all(&self) -> Vec<(String, String, CalibrationVector)>;
}

type Inventory = BTreeMap<(String, String), CalibrationVector>;

#[derive(Default)]
pub struct MemoryCalibrationStore {
    map: RwLock<Inventory>,
}

impl MemoryCalibrationStore {
    pub fn new() -> Self { Self::default() }

    pub fn put(&self, make: &str, model: &str, vector: CalibrationVector) {
        self.map.write().insert((make.to_owned(), model.to_owned()), vector);
    }
    pub fn remove(&self, make: &str, model: &str) -> Option<CalibrationVector> {
        self.map.write().remove(&(make.to_owned(), model.to_owned()))
    }
    pub fn len(&self) -> usize { self.map.read().len() }
    pub fn is_empty(&self) -> bool { self.map.read().is_empty() }
}

impl CalibrationStore for MemoryCalibrationStore {
    fn get(&self, make: &str, model: &str) -> Option<CalibrationVector> {
        self.map.read().get(&(make.to_owned(), model.to_owned())).cloned()
    }
    fn list_all(&self) -> Vec<(String, String, CalibrationVector)> {
        self.map.read().iter().map(|((make, model), v)| (make.clone(), model.clone(), v.clone())).collect()
    }
}

#[derive(Deserialize)]
struct StoredCalibration {
    make: String,
    model: String,
    vector: Vec<Option<f64>>,
}

/// Inventory loaded once from a JSON array of `{ "make", "model", "vector" }`.
///
/// JSON has no infinity, so `null` stands for an open bounding-box side:
/// -inf in a min slot (28, 30, 32) and +inf in a max slot (29, 31, 33).
pub struct JsonCalibrationStore {
    inner: MemoryCalibrationStore,
}

impl JsonCalibrationStore {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let _time = std::time::Instant::now();
        let data = std::fs::read_to_string(path.as_ref())?;
        let store = Self::from_json(&data)?;
        ::log::info!("Loaded {} calibrations from {} in {:.3}ms", store.inner.len(), path.as_ref().display(), _time.elapsed().as_micros() as f64 / 1000.0);
        Ok(store)
    }

    pub fn from_json(data: &str) -> Result<Self, StoreError> {
        let entries: Vec<StoredCalibration> = serde_json::from_str(data)?;
        let inner = MemoryCalibrationStore::new();
        for e in entries {
            let vector = decode_vector(&e.vector).map_err(|source| StoreError::Invalid { make: e.make.clone(), model: e.model.clone(), source })?;
            if inner.get(&e.make, &e.model).is_some() {
                log::warn!("Duplicate calibration for {} {}, keeping the last one", e.make, e.model);
            }
            inner.put(&e.make, &e.model, vector);
        }
        Ok(Self { inner })
    }
}

impl CalibrationStore for JsonCalibrationStore {
    fn get(&self, make: &str, model: &str) -> Option<CalibrationVector> { self.inner.get(make, model) }
    fn list_all(&self) -> Vec<(String, String, CalibrationVector)> { self.inner.list_all() }
}

fn decode_vector(raw: &[Option<f64>]) -> Result<CalibrationVector, CalibrationError> {
    let values = raw.iter().enumerate().map(|(index, x)| match x {
        Some(x) => Ok(*x),
        None if BBOX_SLOTS.contains(&index) => Ok(if (index - BBOX_SLOTS.start) % 2 == 0 { f64::NEG_INFINITY } else { f64::INFINITY }),
        None => Err(CalibrationError::NonFinite { index }),
    }).collect::<Result<Vec<_>, _>>()?;

    CalibrationVector::from_slice(&values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::pinhole_slots;

    fn entry(make: &str, model: &str, vector: &[f64]) -> serde_json::Value {
        let json: Vec<serde_json::Value> = vector.iter().map(|x| if x.is_finite() { (*x).into() } else { serde_json::Value::Null }).collect();
        serde_json::json!({ "make": make, "model": model, "vector": json })
    }

    #[test]
    fn null_bbox_slots_become_open_bounds() {
        let data = serde_json::to_string(&vec![entry("Acme", "X1", &pinhole_slots())]).unwrap();
        let store = JsonCalibrationStore::from_json(&data).unwrap();
        let v = store.get("Acme", "X1").unwrap();
        assert_eq!(v.as_slice(), &pinhole_slots()[..]);
        assert_eq!(v.bounding_box().min[2], f64::NEG_INFINITY);
        assert_eq!(v.bounding_box().max[0], f64::INFINITY);
        assert!(store.get("Acme", "X2").is_none());
    }

    #[test]
    fn null_outside_bbox_is_rejected() {
        let mut v = pinhole_slots();
        v[3] = f64::INFINITY;
        let data = serde_json::to_string(&vec![entry("Acme", "X1", &v)]).unwrap();
        match JsonCalibrationStore::from_json(&data) {
            Err(StoreError::Invalid { make, source, .. }) => {
                assert_eq!(make, "Acme");
                assert_eq!(source, CalibrationError::NonFinite { index: 3 });
            }
            other => panic!("unexpected {:?}", other.map(|s| s.list_all().len())),
        }
    }

    #[test]
    fn short_vector_is_rejected() {
        let data = serde_json::to_string(&vec![entry("Acme", "X1", &pinhole_slots()[..20])]).unwrap();
        assert!(matches!(JsonCalibrationStore::from_json(&data), Err(StoreError::Invalid { source: CalibrationError::WrongLength(20), .. })));
    }

    #[test]
    fn loads_file_sorted_by_camera() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cameras.json");
        let data = serde_json::to_string(&vec![entry("Acme", "X2", &pinhole_slots()), entry("Acme", "X1", &pinhole_slots())]).unwrap();
        std::fs::write(&path, data).unwrap();

        let store = JsonCalibrationStore::load(&path).unwrap();
        let names: Vec<_> = store.list_all().into_iter().map(|(make, model, _)| format!("{make} {model}")).collect();
        assert_eq!(names, vec!["Acme X1", "Acme X2"]);

        assert!(matches!(JsonCalibrationStore::load(dir.path().join("none.json")), Err(StoreError::Io(_))));
    }

    #[test]
    fn memory_store_put_and_remove() {
        let store = MemoryCalibrationStore::new();
        let v = CalibrationVector::from_slice(&pinhole_slots()).unwrap();
        store.put("Acme", "X1", v.clone());
        assert_eq!(store.get("Acme", "X1"), Some(v.clone()));
        assert_eq!(store.remove("Acme", "X1"), Some(v));
        assert!(store.is_empty());
    }
}
