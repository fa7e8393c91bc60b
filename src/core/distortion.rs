// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright © 2024 Adrian <adrian.eddy at gmail>

// Rational radial + tangential model, same layout as OpenCV's CALIB_RATIONAL_MODEL without the thin prism terms.

use serde::{ Serialize, Deserialize };
use crate::calibration::Intrinsics;

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SolverParams {
    /// Largest accepted reprojection error, in pixels.
    pub tolerance_px: f64,
    /// Descent step sizes in pixels, tried in order.
    pub step_sizes: Vec<f64>,
    /// Cap on accepted moves for a single step size.
    pub max_moves_per_step: usize,
}
impl Default for SolverParams {
    fn default() -> Self {
        Self {
            tolerance_px: 0.1,
            step_sizes: vec![1.0, 0.5, 0.25, 0.125],
            max_moves_per_step: 4096,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RaySolution {
    /// Normalised ray at unit depth.
    pub x: f64,
    pub y: f64,
    pub error_px: f64,
    pub moves: usize,
    pub converged: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct RationalModel {
    pub intrinsics: Intrinsics,
}

impl RationalModel {
    pub fn new(intrinsics: Intrinsics) -> Self { Self { intrinsics } }

    /// Applies the distortion to a normalised point.
    pub fn distort_point(&self, (x, y): (f64, f64)) -> (f64, f64) {
        let k = &self.intrinsics.radial;
        let (p1, p2) = (self.intrinsics.tangential[0], self.intrinsics.tangential[1]);

        let r2 = x * x + y * y;
        let r4 = r2 * r2;
        let r6 = r4 * r2;
        let cdist = 1.0 + k[0] * r2 + k[1] * r4 + k[2] * r6;
        let icdist2 = 1.0 / (1.0 + k[3] * r2 + k[4] * r4 + k[5] * r6);
        let a1 = 2.0 * x * y;
        let a2 = r2 + 2.0 * x * x;
        let a3 = r2 + 2.0 * y * y;

        (
            x * cdist * icdist2 + p1 * a1 + p2 * a2,
            y * cdist * icdist2 + p1 * a3 + p2 * a1
        )
    }

    /// Normalised ray -> pixel.
    pub fn project(&self, point: (f64, f64)) -> (f64, f64) {
        let i = &self.intrinsics;
        let (xd, yd) = self.distort_point(point);
        (i.fx * xd + i.cx, i.fy * yd + i.cy)
    }

    /// Pixel -> normalised ray, ignoring distortion.
    pub fn pinhole_ray(&self, (u, v): (f64, f64)) -> (f64, f64) {
        let i = &self.intrinsics;
        ((u - i.cx) / i.fx, (v - i.cy) / i.fy)
    }

    pub fn reprojection_error(&self, ray: (f64, f64), target: (f64, f64)) -> f64 {
        let (u, v) = self.project(ray);
        let err = ((u - target.0).powi(2) + (v - target.1).powi(2)).sqrt();
        if err.is_nan() { f64::INFINITY } else { err }
    }

    /// Finds the ray whose projection lands on `target`, starting at `seed`.
    ///
    /// Coordinate descent: compare the current point against its four neighbours at distance `δ`
    /// along x and y, move to the best one until none improves, then shrink `δ`.
    /// Pure function of its inputs.
    pub fn solve(&self, target: (f64, f64), seed: (f64, f64), params: &SolverParams) -> RaySolution {
        let (mut x, mut y) = seed;
        let mut err = self.reprojection_error((x, y), target);
        let mut moves = 0;

        for &step in &params.step_sizes {
            let dx = step / self.intrinsics.fx;
            let dy = step / self.intrinsics.fy;
            for _ in 0..params.max_moves_per_step {
                let candidates = [(x + dx, y), (x - dx, y), (x, y + dy), (x, y - dy)];
                let mut best = None;
                for c in candidates {
                    let e = self.reprojection_error(c, target);
                    if e < err {
                        err = e;
                        best = Some(c);
                    }
                }
                match best {
                    Some((bx, by)) => { x = bx; y = by; moves += 1; }
                    None => break,
                }
            }
        }

        RaySolution { x, y, error_px: err, moves, converged: err < params.tolerance_px }
    }
}
