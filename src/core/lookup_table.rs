// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright © 2024 Adrian <adrian.eddy at gmail>

use std::sync::Arc;
use chrono::NaiveDate;
use nalgebra::{ Matrix4, Vector3, Vector4 };
use serde::{ Serialize, Deserialize };

use crate::calibration::{ BoundingBox, CalibrationError, CalibrationVector, Intrinsics };

/// f32 slots per pixel.
pub const PIXEL_STRIDE: usize = 12;

pub mod slot {
    pub const X_OFFSET: usize = 0;
    pub const X_SLOPE:  usize = 1;
    pub const Y_OFFSET: usize = 2;
    pub const Y_SLOPE:  usize = 3;
    /// q0..q4, z(s) = Σ qₖ·sᵏ
    pub const QUARTIC:  usize = 4;
    pub const RESIDUAL: usize = 9;
    pub const RAY_NORM: usize = 10;
    pub const MOVES:    usize = 11;
}

#[derive(Deserialize, Serialize, Default, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Dimensions { pub w: usize, pub h: usize }

impl std::fmt::Display for Dimensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "{}x{}", self.w, self.h) }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum GenerationStyle {
    /// Solved at the requested size.
    Direct,
    /// Solved at the native sensor size, centre-cropped, optionally rotated by 180°.
    NativeCrop { native: Dimensions, rotated: bool },
}

/// Extent of the resolved rays at unit depth. Diagnostic only.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq)]
pub struct RayBounds {
    pub x_min: f32,
    pub x_max: f32,
    pub y_min: f32,
    pub y_max: f32,
}

impl Default for RayBounds {
    fn default() -> Self {
        Self { x_min: f32::INFINITY, x_max: f32::NEG_INFINITY, y_min: f32::INFINITY, y_max: f32::NEG_INFINITY }
    }
}

impl RayBounds {
    pub fn include(&mut self, x: f32, y: f32) {
        self.x_min = self.x_min.min(x);
        self.x_max = self.x_max.max(x);
        self.y_min = self.y_min.min(y);
        self.y_max = self.y_max.max(y);
    }
    pub fn merge(&mut self, other: &RayBounds) {
        self.x_min = self.x_min.min(other.x_min);
        self.x_max = self.x_max.max(other.x_max);
        self.y_min = self.y_min.min(other.y_min);
        self.y_max = self.y_max.max(other.y_max);
    }
    pub fn is_empty(&self) -> bool { self.x_min > self.x_max || self.y_min > self.y_max }

    pub fn of_coefficients(coeffs: &[f32]) -> Self {
        let mut b = Self::default();
        for px in coeffs.chunks_exact(PIXEL_STRIDE) {
            if px[slot::X_SLOPE].is_finite() && px[slot::Y_SLOPE].is_finite() {
                b.include(px[slot::X_SLOPE], px[slot::Y_SLOPE]);
            }
        }
        b
    }
}

/// Dense per-pixel depth-to-world table.
///
/// Cloning is cheap: the coefficient buffer is shared, and every transformation
/// allocates a new one instead of writing through the shared one.
#[derive(Clone, Debug)]
pub struct LookUpTable {
    pub width: usize,
    pub height: usize,
    coefficients: Arc<[f32]>,

    pub scale: f64,
    pub z_range: (f64, f64),
    pub intrinsics: Intrinsics,
    pub bounding_box: BoundingBox,
    pub transform: Matrix4<f64>,
    pub make: String,
    pub model: String,
    pub style: GenerationStyle,
    pub as_of_date: Option<NaiveDate>,
    pub ray_bounds: RayBounds,
}

impl PartialEq for LookUpTable {
    fn eq(&self, other: &Self) -> bool {
        self.width == other.width && self.height == other.height
            && self.scale == other.scale && self.z_range == other.z_range
            && self.intrinsics == other.intrinsics && self.bounding_box == other.bounding_box
            && self.transform == other.transform
            && self.make == other.make && self.model == other.model
            && self.style == other.style && self.as_of_date == other.as_of_date
            && self.coefficients_bitwise_eq(other)
    }
}

impl LookUpTable {
    /// Wraps a finished coefficient buffer and stamps it with the vector's metadata.
    /// Callers have already checked the buffer length: the builder sizes it, and the file loader compares it to the header.
    pub(crate) fn new(width: usize, height: usize, coefficients: Vec<f32>, vector: &CalibrationVector, make: &str, model: &str, style: GenerationStyle, as_of_date: Option<NaiveDate>) -> Self {
        debug_assert_eq!(coefficients.len(), width * height * PIXEL_STRIDE, "coefficient buffer does not match {width}x{height}");
        let ray_bounds = RayBounds::of_coefficients(&coefficients);
        Self {
            width,
            height,
            coefficients: coefficients.into(),
            scale: vector.scale(),
            z_range: vector.z_range(),
            intrinsics: vector.intrinsics(),
            bounding_box: vector.bounding_box(),
            transform: vector.transform(),
            make: make.to_owned(),
            model: model.to_owned(),
            style,
            as_of_date,
            ray_bounds,
        }
    }

    pub fn coefficients(&self) -> &[f32] { &self.coefficients }

    pub fn shares_coefficients_with(&self, other: &LookUpTable) -> bool {
        Arc::ptr_eq(&self.coefficients, &other.coefficients)
    }

    /// NaN-aware comparison: unresolved pixels compare equal to each other.
    pub fn coefficients_bitwise_eq(&self, other: &LookUpTable) -> bool {
        self.coefficients.len() == other.coefficients.len()
            && self.coefficients.iter().zip(other.coefficients.iter()).all(|(a, b)| a.to_bits() == b.to_bits())
    }

    pub fn dimensions(&self) -> Dimensions { Dimensions { w: self.width, h: self.height } }

    pub fn pixel(&self, col: usize, row: usize) -> Option<&[f32]> {
        if col >= self.width || row >= self.height { return None; }
        let start = (row * self.width + col) * PIXEL_STRIDE;
        Some(&self.coefficients[start..start + PIXEL_STRIDE])
    }

    pub fn is_resolved(&self, col: usize, row: usize) -> bool {
        self.pixel(col, row).is_some_and(|px| !px[slot::X_SLOPE].is_nan())
    }

    pub fn unresolved_count(&self) -> usize {
        self.coefficients.chunks_exact(PIXEL_STRIDE).filter(|px| px[slot::X_SLOPE].is_nan()).count()
    }

    /// Reassembles the calibration vector this table was generated from.
    pub fn calibration_vector(&self) -> Result<CalibrationVector, CalibrationError> {
        CalibrationVector::from_parts(&self.intrinsics, &self.transform, &self.bounding_box, self.scale, self.z_range)
    }

    /// Same coefficients, metadata taken from `vector`. The buffer stays shared.
    pub fn with_metadata_from(&self, vector: &CalibrationVector, as_of_date: Option<NaiveDate>) -> Self {
        Self {
            transform: vector.transform(),
            bounding_box: vector.bounding_box(),
            z_range: vector.z_range(),
            as_of_date,
            ..self.clone()
        }
    }

    /// Pixel (c, r) takes the record of (w-1-c, h-1-r).
    pub fn rotate_180(&self) -> Self {
        let mut buf = Vec::with_capacity(self.coefficients.len());
        for px in self.coefficients.chunks_exact(PIXEL_STRIDE).rev() {
            buf.extend_from_slice(px);
        }
        let style = match self.style {
            GenerationStyle::NativeCrop { native, rotated } => GenerationStyle::NativeCrop { native, rotated: !rotated },
            GenerationStyle::Direct => GenerationStyle::Direct,
        };
        Self { coefficients: buf.into(), style, ..self.clone() }
    }

    /// Copies the `width`×`height` window starting at (`left`, `top`). Returns `None` if it doesn't fit.
    pub fn crop(&self, left: usize, top: usize, width: usize, height: usize) -> Option<Self> {
        if width == 0 || height == 0 || left + width > self.width || top + height > self.height {
            return None;
        }
        let mut buf = Vec::with_capacity(width * height * PIXEL_STRIDE);
        for row in top..top + height {
            let start = (row * self.width + left) * PIXEL_STRIDE;
            buf.extend_from_slice(&self.coefficients[start..start + width * PIXEL_STRIDE]);
        }
        let ray_bounds = RayBounds::of_coefficients(&buf);
        Some(Self { width, height, coefficients: buf.into(), ray_bounds, ..self.clone() })
    }

    /// Raw depth sample at (col, row) -> world point.
    /// `None` for unresolved pixels and for points outside the z range or bounding box.
    pub fn world_point(&self, col: usize, row: usize, sample: f64) -> Option<Vector3<f64>> {
        let px = self.pixel(col, row)?;
        if px[slot::X_SLOPE].is_nan() { return None; }

        let q = &px[slot::QUARTIC..slot::QUARTIC + 5];
        let z = q.iter().rev().fold(0.0, |acc, &c| acc * sample + c as f64);

        let (near, far) = self.z_range;
        let (lo, hi) = if near < far { (near, far) } else { (far, near) };
        if z < lo || z > hi { return None; }

        // The ray points down -Z, so the XY slopes apply to the distance in front of the camera
        let d = -z;
        let x = px[slot::X_OFFSET] as f64 + px[slot::X_SLOPE] as f64 * d;
        let y = px[slot::Y_OFFSET] as f64 + px[slot::Y_SLOPE] as f64 * d;

        let w = self.transform * Vector4::new(x, y, z, 1.0);
        if w[3] == 0.0 { return None; }
        let p = Vector3::new(w[0] / w[3], w[1] / w[3], w[2] / w[3]);

        if !self.bounding_box.contains(&[p[0], p[1], p[2]]) { return None; }
        Some(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::pinhole_slots;

    fn numbered(w: usize, h: usize) -> LookUpTable {
        let v = CalibrationVector::from_slice(&pinhole_slots()).unwrap();
        let mut buf = vec![0.0f32; w * h * PIXEL_STRIDE];
        for (i, px) in buf.chunks_exact_mut(PIXEL_STRIDE).enumerate() {
            px[slot::X_SLOPE] = (i % w) as f32;
            px[slot::Y_SLOPE] = (i / w) as f32;
            px[slot::QUARTIC + 1] = -0.25;
        }
        LookUpTable::new(w, h, buf, &v, "Acme", "X1", GenerationStyle::Direct, None)
    }

    #[test]
    fn rotate_180_mirrors_both_axes() {
        let t = numbered(4, 3);
        let r = t.rotate_180();
        assert!(!r.shares_coefficients_with(&t));
        assert_eq!(r.pixel(0, 0).unwrap()[slot::X_SLOPE], 3.0);
        assert_eq!(r.pixel(0, 0).unwrap()[slot::Y_SLOPE], 2.0);
        assert_eq!(r.pixel(3, 2).unwrap()[slot::X_SLOPE], 0.0);
        assert_eq!(r.make, "Acme");
        assert_eq!(r.transform, t.transform);
        assert_eq!(r.rotate_180(), t);
    }

    #[test]
    fn crop_recomputes_bounds() {
        let t = numbered(6, 5);
        assert_eq!(t.ray_bounds, RayBounds { x_min: 0.0, x_max: 5.0, y_min: 0.0, y_max: 4.0 });
        let c = t.crop(1, 2, 3, 2).unwrap();
        assert_eq!((c.width, c.height), (3, 2));
        assert_eq!(c.pixel(0, 0).unwrap()[slot::X_SLOPE], 1.0);
        assert_eq!(c.pixel(0, 0).unwrap()[slot::Y_SLOPE], 2.0);
        assert_eq!(c.ray_bounds, RayBounds { x_min: 1.0, x_max: 3.0, y_min: 2.0, y_max: 3.0 });
        assert_eq!(c.model, "X1");
        assert!(t.crop(4, 0, 3, 1).is_none());
        assert!(t.crop(0, 0, 0, 1).is_none());
    }

    #[test]
    fn unresolved_pixels_are_counted_and_skipped() {
        let v = CalibrationVector::from_slice(&pinhole_slots()).unwrap();
        let mut buf = vec![0.0f32; 2 * PIXEL_STRIDE];
        buf[PIXEL_STRIDE..PIXEL_STRIDE + 9].fill(f32::NAN);
        let t = LookUpTable::new(2, 1, buf, &v, "Acme", "X1", GenerationStyle::Direct, None);
        assert_eq!(t.unresolved_count(), 1);
        assert!(t.is_resolved(0, 0));
        assert!(!t.is_resolved(1, 0));
        assert!(t.world_point(1, 0, 1000.0).is_none());
        assert_eq!(t, t.clone());
    }

    #[test]
    fn world_point_applies_depth_scale_and_transform() {
        let mut slots = pinhole_slots();
        slots[15] = 10.0; // translate x
        let v = CalibrationVector::from_slice(&slots).unwrap();
        let mut buf = vec![0.0f32; PIXEL_STRIDE];
        buf[slot::X_SLOPE] = 0.5;
        buf[slot::Y_SLOPE] = -0.25;
        buf[slot::QUARTIC + 1] = -0.25;
        let t = LookUpTable::new(1, 1, buf, &v, "Acme", "X1", GenerationStyle::Direct, None);

        let p = t.world_point(0, 0, 4000.0).unwrap();
        assert!((p - Vector3::new(510.0, -250.0, -1000.0)).norm() < 1e-9);

        // beyond zMax
        assert!(t.world_point(0, 0, 20000.0).is_none());
    }

    #[test]
    fn metadata_patch_shares_buffer() {
        let t = numbered(3, 3);
        let mut slots = pinhole_slots();
        slots[19] = -7.0;
        let v = CalibrationVector::from_slice(&slots).unwrap();
        let p = t.with_metadata_from(&v, NaiveDate::from_ymd_opt(2024, 1, 1));
        assert!(p.shares_coefficients_with(&t));
        assert_eq!(p.transform[(1, 3)], -7.0);
        assert_eq!(p.calibration_vector().unwrap(), v);
    }
}
