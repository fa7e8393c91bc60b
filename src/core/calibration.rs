// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright © 2024 Adrian <adrian.eddy at gmail>

use nalgebra::Matrix4;
use std::ops::Range;

pub const VECTOR_LEN: usize = 37;

pub const INTRINSIC_SLOTS: Range<usize> = 0..12;
pub const TRANSFORM_SLOTS: Range<usize> = 12..28;
pub const BBOX_SLOTS:      Range<usize> = 28..34;
pub const DEPTH_SLOTS:     Range<usize> = 34..37;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("Calibration vector must have 37 entries, got {0}")] WrongLength(usize),
    #[error("Calibration entry {index} must be finite")]                  NonFinite { index: usize },
    #[error("Calibration entry {index} is NaN")]                          NaN { index: usize },
}

/// Camera intrinsics in vector order: fx, cx, fy, cy, k1..k6 (rational radial), p1, p2.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Intrinsics {
    pub fx: f64,
    pub cx: f64,
    pub fy: f64,
    pub cy: f64,
    /// k1, k2, k3 numerator; k4, k5, k6 denominator.
    pub radial: [f64; 6],
    pub tangential: [f64; 2],
}

impl Intrinsics {
    pub fn from_slots(s: &[f64; 12]) -> Self {
        Self {
            fx: s[0], cx: s[1], fy: s[2], cy: s[3],
            radial: [s[4], s[5], s[6], s[7], s[8], s[9]],
            tangential: [s[10], s[11]],
        }
    }
    pub fn to_slots(&self) -> [f64; 12] {
        let r = &self.radial;
        [self.fx, self.cx, self.fy, self.cy, r[0], r[1], r[2], r[3], r[4], r[5], self.tangential[0], self.tangential[1]]
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

impl BoundingBox {
    pub fn infinite() -> Self {
        Self { min: [f64::NEG_INFINITY; 3], max: [f64::INFINITY; 3] }
    }
    pub fn from_slots(s: &[f64; 6]) -> Self {
        Self { min: [s[0], s[2], s[4]], max: [s[1], s[3], s[5]] }
    }
    pub fn to_slots(&self) -> [f64; 6] {
        [self.min[0], self.max[0], self.min[1], self.max[1], self.min[2], self.max[2]]
    }
    pub fn contains(&self, p: &[f64; 3]) -> bool {
        (0..3).all(|i| p[i] >= self.min[i] && p[i] <= self.max[i])
    }
}

/// The 37-slot "JETR" calibration record. Immutable once validated.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationVector([f64; VECTOR_LEN]);

impl CalibrationVector {
    pub fn from_slice(v: &[f64]) -> Result<Self, CalibrationError> {
        if v.len() != VECTOR_LEN {
            return Err(CalibrationError::WrongLength(v.len()));
        }
        for (index, x) in v.iter().enumerate() {
            if x.is_nan() {
                return Err(CalibrationError::NaN { index });
            }
            if !BBOX_SLOTS.contains(&index) && !x.is_finite() {
                return Err(CalibrationError::NonFinite { index });
            }
        }
        let mut arr = [0.0; VECTOR_LEN];
        arr.copy_from_slice(v);
        Ok(Self(arr))
    }

    pub fn from_parts(intrinsics: &Intrinsics, transform: &Matrix4<f64>, bbox: &BoundingBox, scale: f64, z_range: (f64, f64)) -> Result<Self, CalibrationError> {
        let mut v = Vec::with_capacity(VECTOR_LEN);
        v.extend_from_slice(&intrinsics.to_slots());
        // nalgebra is column-major, the vector is row-major
        for r in 0..4 {
            for c in 0..4 {
                v.push(transform[(r, c)]);
            }
        }
        v.extend_from_slice(&bbox.to_slots());
        v.extend_from_slice(&[scale, z_range.0, z_range.1]);
        Self::from_slice(&v)
    }

    pub fn as_slice(&self) -> &[f64] { &self.0 }

    pub fn intrinsic_slots(&self) -> &[f64] { &self.0[INTRINSIC_SLOTS] }
    pub fn transform_slots(&self) -> &[f64] { &self.0[TRANSFORM_SLOTS] }
    pub fn bbox_slots(&self)      -> &[f64] { &self.0[BBOX_SLOTS] }
    pub fn depth_slots(&self)     -> &[f64] { &self.0[DEPTH_SLOTS] }

    pub fn intrinsics(&self) -> Intrinsics {
        let mut s = [0.0; 12];
        s.copy_from_slice(self.intrinsic_slots());
        Intrinsics::from_slots(&s)
    }

    pub fn transform(&self) -> Matrix4<f64> {
        Matrix4::from_row_slice(self.transform_slots())
    }

    pub fn bounding_box(&self) -> BoundingBox {
        let mut s = [0.0; 6];
        s.copy_from_slice(self.bbox_slots());
        BoundingBox::from_slots(&s)
    }

    pub fn scale(&self) -> f64 { self.0[34] }

    /// Near and far planes, negative-Z-forward.
    pub fn z_range(&self) -> (f64, f64) { (self.0[35], self.0[36]) }
}

/// fx = fy = 500 at the centre of a 640x480 sensor, no distortion, identity pose.
#[cfg(test)]
pub(crate) fn pinhole_slots() -> Vec<f64> {
    let mut v = vec![500.0, 320.0, 500.0, 240.0];
    v.extend([0.0; 8]);
    v.extend(Matrix4::<f64>::identity().transpose().iter());
    v.extend(BoundingBox::infinite().to_slots());
    v.extend([0.25, -150.0, -3500.0]);
    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn pinhole() -> Vec<f64> { pinhole_slots() }

    #[test]
    fn accepts_infinite_bounding_box() {
        let v = CalibrationVector::from_slice(&pinhole()).unwrap();
        assert_eq!(v.bounding_box(), BoundingBox::infinite());
        assert_eq!(v.intrinsics().fx, 500.0);
        assert_eq!(v.intrinsics().cy, 240.0);
        assert_eq!(v.transform(), Matrix4::identity());
        assert_eq!(v.scale(), 0.25);
        assert_eq!(v.z_range(), (-150.0, -3500.0));
    }

    #[test_case(36 ; "too short")]
    #[test_case(38 ; "too long")]
    #[test_case(0  ; "empty")]
    fn rejects_wrong_length(len: usize) {
        let mut v = pinhole();
        v.resize(len, 0.0);
        assert_eq!(CalibrationVector::from_slice(&v), Err(CalibrationError::WrongLength(len)));
    }

    #[test_case(0,  f64::INFINITY => Err(CalibrationError::NonFinite { index: 0 }) ; "infinite focal length")]
    #[test_case(15, f64::NEG_INFINITY => Err(CalibrationError::NonFinite { index: 15 }) ; "infinite transform")]
    #[test_case(30, f64::NAN => Err(CalibrationError::NaN { index: 30 }) ; "nan in bbox")]
    #[test_case(36, f64::NAN => Err(CalibrationError::NaN { index: 36 }) ; "nan in depth")]
    fn validates_entries(index: usize, value: f64) -> Result<(), CalibrationError> {
        let mut v = pinhole();
        v[index] = value;
        CalibrationVector::from_slice(&v).map(|_| ())
    }

    #[test]
    fn parts_round_trip() {
        let mut raw = pinhole();
        raw[15] = 12.5; // row 0, col 3: translation x
        raw[4] = 0.1;
        let v = CalibrationVector::from_slice(&raw).unwrap();
        assert_eq!(v.transform()[(0, 3)], 12.5);
        let back = CalibrationVector::from_parts(&v.intrinsics(), &v.transform(), &v.bounding_box(), v.scale(), v.z_range()).unwrap();
        assert_eq!(back, v);
    }
}
