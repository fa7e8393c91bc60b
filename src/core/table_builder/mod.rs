// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright © 2024 Adrian <adrian.eddy at gmail>

use std::sync::atomic::AtomicBool;
use chrono::NaiveDate;

use crate::calibration::{ CalibrationError, CalibrationVector };
use crate::distortion::{ RationalModel, SolverParams };
use crate::lookup_table::{ Dimensions, GenerationStyle, LookUpTable };
use crate::progress::ProgressSink;
use crate::settings::LutConfig;

mod rows;
pub mod quirks;
pub use quirks::DeviceQuirk;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum BuildError {
    #[error("Invalid calibration vector: {0}")]                   InvalidVector(#[from] CalibrationError),
    #[error("Build cancelled")]                                   Cancelled,
    #[error("Cannot build {requested} table (native {native:?})")] InvalidDimensions { requested: Dimensions, native: Option<Dimensions> },
    #[error("Build abandoned before completion")]                 Abandoned,
    #[error("Failed to start worker pool: {0}")]                  WorkerPool(String),
}

#[derive(Clone, Debug)]
pub struct BuildOptions {
    pub solver: SolverParams,
    /// `None`: half the available cores.
    pub worker_threads: Option<usize>,
    pub rows_per_batch: usize,
    pub quirks: Vec<DeviceQuirk>,
}

impl Default for BuildOptions {
    fn default() -> Self { Self::from_config(&LutConfig::default()) }
}

impl BuildOptions {
    pub fn from_config(config: &LutConfig) -> Self {
        Self {
            solver: config.solver.clone(),
            worker_threads: config.worker_threads,
            rows_per_batch: config.rows_per_batch,
            quirks: config.device_quirks.clone(),
        }
    }

    // Memory-bound, so more threads than this only hurts
    pub fn thread_count(&self) -> usize {
        self.worker_threads.unwrap_or_else(|| {
            std::thread::available_parallelism().map(|n| n.get() / 2).unwrap_or(1)
        }).max(1)
    }

    pub fn quirk_for(&self, make: &str, model: &str) -> Option<&DeviceQuirk> {
        quirks::find(&self.quirks, make, model)
    }
}

/// Solves the whole table for one camera at `width`×`height`.
///
/// Cameras listed in `options.quirks` are solved at their native size, centre-cropped,
/// and rotated by 180° when `as_of_date` predates their remount.
#[allow(clippy::too_many_arguments)]
pub fn build_table(width: usize, height: usize, vector: &[f64], make: &str, model: &str, as_of_date: Option<NaiveDate>, options: &BuildOptions, cancel: &AtomicBool, progress: &dyn ProgressSink) -> Result<LookUpTable, BuildError> {
    let vector = CalibrationVector::from_slice(vector)?;
    let requested = Dimensions { w: width, h: height };

    if width == 0 || height == 0 {
        return Err(BuildError::InvalidDimensions { requested, native: None });
    }

    let _time = std::time::Instant::now();
    let distortion = RationalModel::new(vector.intrinsics());

    let table = if let Some(quirk) = options.quirk_for(make, model) {
        let native = quirk.native;
        let (left, top) = quirk.crop_origin(requested).ok_or(BuildError::InvalidDimensions { requested, native: Some(native) })?;

        let solved = rows::solve_rows(native.w, native.h, &distortion, vector.scale(), options, cancel, progress)?;
        log_solved(make, model, native, solved.unresolved, &solved.bounds);

        let style = GenerationStyle::NativeCrop { native, rotated: false };
        let native_table = LookUpTable::new(native.w, native.h, solved.coefficients, &vector, make, model, style, as_of_date);
        let cropped = native_table.crop(left, top, width, height).ok_or(BuildError::InvalidDimensions { requested, native: Some(native) })?;

        if quirk.rotation_applies(as_of_date) {
            log::debug!("{make} {model}: {as_of_date:?} predates {:?}, rotating by 180°", quirk.rotation_cutoff);
            cropped.rotate_180()
        } else {
            cropped
        }
    } else {
        let solved = rows::solve_rows(width, height, &distortion, vector.scale(), options, cancel, progress)?;
        log_solved(make, model, requested, solved.unresolved, &solved.bounds);
        LookUpTable::new(width, height, solved.coefficients, &vector, make, model, GenerationStyle::Direct, as_of_date)
    };

    ::log::info!("Built {make} {model} {requested} table in {:.3}ms", _time.elapsed().as_micros() as f64 / 1000.0);
    Ok(table)
}

fn log_solved(make: &str, model: &str, size: Dimensions, unresolved: usize, bounds: &crate::lookup_table::RayBounds) {
    if unresolved > 0 {
        log::warn!("{make} {model} {size}: {unresolved} of {} pixels did not converge", size.w * size.h);
    }
    log::debug!("{make} {model} {size}: ray x [{:.4}, {:.4}], y [{:.4}, {:.4}]", bounds.x_min, bounds.x_max, bounds.y_min, bounds.y_max);
}
