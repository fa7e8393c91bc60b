// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright © 2024 Adrian <adrian.eddy at gmail>

use std::path::Path;
use std::time::Duration;
use serde::{ Serialize, Deserialize };

use crate::distortion::SolverParams;
use crate::lookup_table::Dimensions;
use crate::table_builder::DeviceQuirk;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0:?}")]          Io(#[from] std::io::Error),
    #[error("Invalid config: {0}")]      Parse(#[from] serde_json::Error),
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct LutConfig {
    /// Sizes the background scheduler pre-builds for every known camera.
    pub standard_dimensions: Vec<Dimensions>,
    pub device_quirks: Vec<DeviceQuirk>,
    pub solver: SolverParams,
    pub worker_threads: Option<usize>,
    pub rows_per_batch: usize,
    pub stop_timeout_ms: u64,
}

impl Default for LutConfig {
    fn default() -> Self {
        Self {
            standard_dimensions: vec![Dimensions { w: 640, h: 480 }],
            device_quirks: Vec::new(),
            solver: SolverParams::default(),
            worker_threads: None,
            rows_per_batch: 16,
            stop_timeout_ms: 5000,
        }
    }
}

impl LutConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&data)?;
        log::info!("Loaded LUT config from {}: {} standard sizes, {} device quirks", path.as_ref().display(), config.standard_dimensions.len(), config.device_quirks.len());
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn stop_timeout(&self) -> Duration { Duration::from_millis(self.stop_timeout_ms) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let c: LutConfig = serde_json::from_str(r#"{ "rows_per_batch": 4 }"#).unwrap();
        assert_eq!(c.rows_per_batch, 4);
        assert_eq!(c.standard_dimensions, vec![Dimensions { w: 640, h: 480 }]);
        assert_eq!(c.solver.step_sizes, vec![1.0, 0.5, 0.25, 0.125]);
        assert_eq!(c.stop_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn loads_quirks_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lut.json");
        std::fs::write(&path, r#"{
            "standard_dimensions": [{ "w": 640, "h": 480 }, { "w": 320, "h": 240 }],
            "device_quirks": [{ "make": "Acme", "model": "Tall", "native": { "w": 640, "h": 576 }, "rotation_cutoff": "2023-06-15" }]
        }"#).unwrap();

        let c = LutConfig::load(&path).unwrap();
        assert_eq!(c.standard_dimensions.len(), 2);
        assert_eq!(c.device_quirks[0].rotation_cutoff, NaiveDate::from_ymd_opt(2023, 6, 15));
        assert_eq!(c.device_quirks[0].native, Dimensions { w: 640, h: 576 });

        let again: LutConfig = serde_json::from_str(&c.to_json().unwrap()).unwrap();
        assert_eq!(again, c);
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lut.json");
        std::fs::write(&path, "{ nope").unwrap();
        assert!(matches!(LutConfig::load(&path), Err(ConfigError::Parse(_))));
        assert!(matches!(LutConfig::load(dir.path().join("missing.json")), Err(ConfigError::Io(_))));
    }
}
