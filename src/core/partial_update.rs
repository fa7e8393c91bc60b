// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright © 2024 Adrian <adrian.eddy at gmail>

//! Decides whether a cached table can survive a calibration change.
//!
//! | changed                         | action                          |
//! |---------------------------------|---------------------------------|
//! | intrinsics / distortion [0..12) | rebuild                         |
//! | depth scale [34]                | rebuild (baked into the quartic)|
//! | date crosses rotation cutoff    | rebuild (baked into the layout) |
//! | transform, bbox, z range        | patch metadata, share buffer    |
//! | nothing relevant                | reuse                           |

use chrono::NaiveDate;
use crate::calibration::CalibrationVector;
use crate::table_builder::DeviceQuirk;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildReason {
    /// No table cached for the key.
    Missing,
    IntrinsicsChanged,
    ScaleChanged,
    RotationCutoffCrossed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateDecision {
    Reuse,
    Patch { transform: bool, bounding_box: bool, z_range: bool },
    Rebuild(RebuildReason),
}

impl UpdateDecision {
    pub fn is_rebuild(&self) -> bool { matches!(self, Self::Rebuild(_)) }
}

pub fn decide(cached: &CalibrationVector, cached_date: Option<NaiveDate>, new: &CalibrationVector, new_date: Option<NaiveDate>, quirk: Option<&DeviceQuirk>) -> UpdateDecision {
    if cached.intrinsic_slots() != new.intrinsic_slots() {
        return UpdateDecision::Rebuild(RebuildReason::IntrinsicsChanged);
    }
    if cached.scale() != new.scale() {
        return UpdateDecision::Rebuild(RebuildReason::ScaleChanged);
    }
    if let Some(q) = quirk {
        if q.rotation_applies(cached_date) != q.rotation_applies(new_date) {
            return UpdateDecision::Rebuild(RebuildReason::RotationCutoffCrossed);
        }
    }

    let transform    = cached.transform_slots() != new.transform_slots();
    let bounding_box = cached.bbox_slots()      != new.bbox_slots();
    let z_range      = cached.z_range()         != new.z_range();

    if transform || bounding_box || z_range {
        UpdateDecision::Patch { transform, bounding_box, z_range }
    } else {
        UpdateDecision::Reuse
    }
}
