// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright © 2024 Adrian <adrian.eddy at gmail>

#![allow(dead_code)]

use std::sync::Arc;
use chrono::NaiveDate;
use depthlut_core::*;
use depthlut_core::table_builder::DeviceQuirk;

/// Distortion-free camera looking down -Z: fx = fy = `f`, principal point in the middle of `w`×`h`.
pub fn pinhole(f: f64, w: usize, h: usize) -> Vec<f64> {
    let mut v = vec![0.0; 37];
    v[0] = f;
    v[1] = w as f64 / 2.0;
    v[2] = f;
    v[3] = h as f64 / 2.0;
    for i in 0..4 { v[12 + i * 5] = 1.0; }
    for i in 0..3 {
        v[28 + i * 2] = f64::NEG_INFINITY;
        v[29 + i * 2] = f64::INFINITY;
    }
    v[34] = 0.25;
    v[35] = -150.0;
    v[36] = -3500.0;
    v
}

pub fn small_vector() -> Vec<f64> { pinhole(50.0, 64, 48) }

pub fn date(y: i32, m: u32, d: u32) -> Option<NaiveDate> { NaiveDate::from_ymd_opt(y, m, d) }

pub fn tall_quirk() -> DeviceQuirk {
    DeviceQuirk { make: "Acme".into(), model: "Tall".into(), native: Dimensions { w: 64, h: 56 }, rotation_cutoff: date(2023, 6, 15) }
}

pub fn config() -> LutConfig {
    LutConfig {
        standard_dimensions: vec![Dimensions { w: 64, h: 48 }],
        device_quirks: vec![tall_quirk()],
        worker_threads: Some(2),
        rows_per_batch: 8,
        ..Default::default()
    }
}

pub fn service(cameras: &[&str]) -> LutService {
    let store = MemoryCalibrationStore::new();
    for model in cameras {
        store.put("Acme", model, CalibrationVector::from_slice(&small_vector()).unwrap());
    }
    LutService::new(config(), Arc::new(store))
}
