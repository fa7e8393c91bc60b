// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright © 2024 Adrian <adrian.eddy at gmail>

use std::sync::atomic::{ AtomicBool, AtomicUsize, Ordering::SeqCst };
use parking_lot::Mutex;
use rayon::{ slice::ParallelSliceMut, iter::IndexedParallelIterator, iter::ParallelIterator };

use crate::distortion::{ RationalModel, SolverParams };
use crate::lookup_table::{ PIXEL_STRIDE, RayBounds, slot };
use crate::progress::{ Flow, ProgressSink };
use super::{ BuildError, BuildOptions };

pub struct SolvedRows {
    pub coefficients: Vec<f32>,
    pub bounds: RayBounds,
    pub unresolved: usize,
}

/// Solves every pixel of a `width`×`height` grid, one row per task.
///
/// Rows are handed to the pool in batches; `cancel` and the sink are consulted between batches
/// and workers additionally poll `cancel` between pixels.
pub fn solve_rows(width: usize, height: usize, model: &RationalModel, scale: f64, options: &BuildOptions, cancel: &AtomicBool, progress: &dyn ProgressSink) -> Result<SolvedRows, BuildError> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.thread_count())
        .thread_name(|i| format!("lut-rows-{i}"))
        .build()
        .map_err(|e| BuildError::WorkerPool(e.to_string()))?;

    let row_len = width * PIXEL_STRIDE;
    let batch_rows = options.rows_per_batch.max(1);
    let mut coefficients = vec![f32::NAN; row_len * height];

    let bounds = Mutex::new(RayBounds::default());
    let unresolved = AtomicUsize::new(0);
    let sink_cancelled = AtomicBool::new(false);
    let is_cancelled = || cancel.load(SeqCst) || sink_cancelled.load(SeqCst);

    let mut done = 0;
    for (batch, chunk) in coefficients.chunks_mut(row_len * batch_rows).enumerate() {
        if is_cancelled() { return Err(BuildError::Cancelled); }

        let first_row = batch * batch_rows;
        pool.install(|| {
            chunk.par_chunks_mut(row_len).enumerate().for_each(|(i, row)| { // Parallel iterator over rows
                let (row_bounds, row_unresolved) = solve_row(model, first_row + i, row, scale, &options.solver, &is_cancelled);
                bounds.lock().merge(&row_bounds);
                unresolved.fetch_add(row_unresolved, SeqCst);
            });
        });

        done += chunk.len() / row_len;
        if progress.report(done, height) == Flow::Cancel {
            sink_cancelled.store(true, SeqCst);
        }
    }
    if is_cancelled() { return Err(BuildError::Cancelled); }

    Ok(SolvedRows {
        coefficients,
        bounds: bounds.into_inner(),
        unresolved: unresolved.into_inner(),
    })
}

/// Warm-starts each pixel from its left neighbour. Returns the row's ray bounds and unresolved count.
fn solve_row(model: &RationalModel, row: usize, out: &mut [f32], scale: f64, params: &SolverParams, is_cancelled: &(impl Fn() -> bool + Sync)) -> (RayBounds, usize) {
    let mut bounds = RayBounds::default();
    let mut unresolved = 0;
    let mut seed = None;

    for (col, px) in out.chunks_exact_mut(PIXEL_STRIDE).enumerate() {
        if is_cancelled() { break; }

        let target = (col as f64, row as f64);
        let start = seed.unwrap_or_else(|| model.pinhole_ray(target));
        let s = model.solve(target, start, params);

        if s.converged {
            px[slot::X_OFFSET] = 0.0;
            px[slot::X_SLOPE]  = s.x as f32;
            px[slot::Y_OFFSET] = 0.0;
            px[slot::Y_SLOPE]  = s.y as f32;
            px[slot::QUARTIC..slot::QUARTIC + 5].copy_from_slice(&[0.0, -scale as f32, 0.0, 0.0, 0.0]);
            px[slot::RAY_NORM] = (1.0 + s.x * s.x + s.y * s.y).sqrt() as f32;
            bounds.include(s.x as f32, s.y as f32);
            seed = Some((s.x, s.y));
        } else {
            px[..slot::RESIDUAL].fill(f32::NAN);
            px[slot::RAY_NORM] = f32::NAN;
            unresolved += 1;
            seed = None;
        }
        px[slot::RESIDUAL] = s.error_px as f32;
        px[slot::MOVES] = s.moves as f32;
    }
    (bounds, unresolved)
}
